/// Convolution layers: the dense baseline and its masked (subnet) counterpart.
///
/// `Conv2dSubnet` mirrors `LinearSubnet` with weight shape
/// [out_channels, in_channels / groups, kh, kw] and the usual stride,
/// padding, dilation and groups. Unlike the linear variant, the frozen bias
/// is applied (unmasked) in the forward pass.

use rand::rngs::StdRng;
use tracing::debug;

use crate::checkpoint::StateDict;
use crate::config::SubnetConfig;
use crate::conv::{self, Conv2dGeometry};
use crate::error::Result;
use crate::init::{self, Initializer};
use crate::params::{Frozen, RetainFraction, Trainable};
use crate::subnet;
use crate::tape::{BufId, Tape};
use crate::tensor::{self, ensure_shape, Tensor};
use crate::traced;

fn new_bias(geom: &Conv2dGeometry, bias: bool, rng: &mut StdRng) -> Result<Option<Tensor>> {
    if !bias {
        return Ok(None);
    }
    let mut b = Tensor::zeros(&[geom.out_channels]);
    init::dense_bias_init(&mut b, &geom.weight_shape(), rng)?;
    Ok(Some(b))
}

fn load_bias(sd: &StateDict, geom: &Conv2dGeometry, present: bool) -> Result<Option<Tensor>> {
    if !present {
        return Ok(None);
    }
    let b = sd.tensor("bias")?;
    ensure_shape("bias", &[geom.out_channels], &b.shape)?;
    Ok(Some(b))
}

// ── Masked conv ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Conv2dSubnet {
    geom: Conv2dGeometry,
    k: RetainFraction,
    weight: Frozen,
    bias: Option<Frozen>,
    popup_scores: Trainable,
}

impl Conv2dSubnet {
    pub fn new(geom: Conv2dGeometry, bias: bool, subnet: &SubnetConfig) -> Result<Self> {
        let mut rng = init::make_rng(subnet.seed);
        Self::with_initializer(geom, bias, subnet.k, &subnet.init, &mut rng)
    }

    pub fn with_initializer(
        geom: Conv2dGeometry,
        bias: bool,
        k: RetainFraction,
        init: &dyn Initializer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        geom.validate()?;
        let shape = geom.weight_shape();
        let bias = new_bias(&geom, bias, rng)?;
        let scores = init::randn(&shape, rng);
        let mut weight = Tensor::zeros(&shape);
        init.initialize(&mut weight, k, rng)?;
        debug!(in_channels = geom.in_channels, out_channels = geom.out_channels,
               kernel = ?geom.kernel_size, groups = geom.groups, k = k.get(),
               "constructed Conv2dSubnet");
        Ok(Conv2dSubnet {
            geom,
            k,
            weight: Frozen::new(weight),
            bias: bias.map(Frozen::new),
            popup_scores: Trainable::new(scores),
        })
    }

    /// Assemble from existing tensors; all shapes are checked against `geom`.
    pub fn from_parts(
        geom: Conv2dGeometry,
        k: RetainFraction,
        weight: Tensor,
        bias: Option<Tensor>,
        scores: Tensor,
    ) -> Result<Self> {
        geom.validate()?;
        let shape = geom.weight_shape();
        ensure_shape("weight", &shape, &weight.shape)?;
        ensure_shape("popup_scores", &shape, &scores.shape)?;
        if let Some(b) = &bias {
            ensure_shape("bias", &[geom.out_channels], &b.shape)?;
        }
        Ok(Conv2dSubnet {
            geom,
            k,
            weight: Frozen::new(weight),
            bias: bias.map(Frozen::new),
            popup_scores: Trainable::new(scores),
        })
    }

    pub fn geometry(&self) -> &Conv2dGeometry {
        &self.geom
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn k(&self) -> RetainFraction {
        self.k
    }

    pub fn weight(&self) -> &Frozen {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Frozen> {
        self.bias.as_ref()
    }

    pub fn scores(&self) -> &Trainable {
        &self.popup_scores
    }

    pub fn scores_mut(&mut self) -> &mut Trainable {
        &mut self.popup_scores
    }

    pub fn mask(&self) -> Tensor {
        subnet::get_subnet(&self.popup_scores.tensor().abs(), self.k)
    }

    /// Untracked forward: x [N, C_in, H, W] → [N, C_out, H_out, W_out], bias applied.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = self.geom.dims_for(&x.shape)?;
        let mask = self.mask();
        let mut w_eff = vec![0.0f32; mask.numel()];
        tensor::mul_f32(&self.weight.tensor().data, &mask.data, &mut w_eff);
        let bias = self.bias.as_ref().map(|b| b.tensor().data.as_slice());
        let out = conv::conv2d_forward(&x.data, &w_eff, bias, &dims);
        Tensor::from_vec(out, &dims.output_shape())
    }

    pub fn forward_traced(&self, tape: &mut Tape, x: BufId) -> Result<BufId> {
        let dims = self.geom.dims_for(tape.buf_shape(x))?;
        let s = tape.register_trainable(&self.popup_scores);
        let s_abs = traced::traced_abs(tape, s);
        let mask = traced::traced_get_subnet(tape, s_abs, self.k);
        let w = tape.register_frozen(&self.weight);
        let w_eff = traced::traced_mul(tape, w, mask);
        let b = self.bias.as_ref().map(|b| tape.register_frozen(b));
        Ok(traced::traced_conv2d(tape, x, w_eff, b, dims))
    }

    pub fn trainable_params_mut(&mut self) -> Vec<&mut Trainable> {
        vec![&mut self.popup_scores]
    }

    pub fn state_dict(&self) -> StateDict {
        let mut sd = StateDict::new();
        sd.insert_frozen("weight", &self.weight);
        if let Some(b) = &self.bias {
            sd.insert_frozen("bias", b);
        }
        sd.insert_trainable("popup_scores", &self.popup_scores);
        sd
    }

    /// Restore tensors in place; the scores keep their `ParamId`. Shapes are
    /// all checked before anything is written.
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        let shape = self.geom.weight_shape();
        let weight = sd.tensor("weight")?;
        ensure_shape("weight", &shape, &weight.shape)?;
        let scores = sd.tensor("popup_scores")?;
        ensure_shape("popup_scores", &shape, &scores.shape)?;
        let bias = load_bias(sd, &self.geom, self.has_bias())?;
        self.weight.overwrite(weight);
        if let (Some(slot), Some(b)) = (self.bias.as_mut(), bias) {
            slot.overwrite(b);
        }
        *self.popup_scores.tensor_mut() = scores;
        Ok(())
    }
}

// ── Dense conv ───────────────────────────────────────────────────────

/// Standard convolution with trainable weight and bias.
/// Exists as the source layer type for model surgery.
#[derive(Clone, Debug)]
pub struct DenseConv2d {
    geom: Conv2dGeometry,
    weight: Trainable,
    bias: Option<Trainable>,
}

impl DenseConv2d {
    pub fn new(geom: Conv2dGeometry, bias: bool, seed: Option<u64>) -> Result<Self> {
        geom.validate()?;
        let mut rng = init::make_rng(seed);
        let mut weight = Tensor::zeros(&geom.weight_shape());
        init::dense_weight_init(&mut weight, &mut rng)?;
        let bias = new_bias(&geom, bias, &mut rng)?;
        Ok(DenseConv2d { geom, weight: Trainable::new(weight), bias: bias.map(Trainable::new) })
    }

    pub fn geometry(&self) -> &Conv2dGeometry {
        &self.geom
    }

    pub fn weight(&self) -> &Trainable {
        &self.weight
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = self.geom.dims_for(&x.shape)?;
        let bias = self.bias.as_ref().map(|b| b.tensor().data.as_slice());
        let out = conv::conv2d_forward(&x.data, &self.weight.tensor().data, bias, &dims);
        Tensor::from_vec(out, &dims.output_shape())
    }

    pub fn forward_traced(&self, tape: &mut Tape, x: BufId) -> Result<BufId> {
        let dims = self.geom.dims_for(tape.buf_shape(x))?;
        let w = tape.register_trainable(&self.weight);
        let b = self.bias.as_ref().map(|b| tape.register_trainable(b));
        Ok(traced::traced_conv2d(tape, x, w, b, dims))
    }

    pub fn trainable_params_mut(&mut self) -> Vec<&mut Trainable> {
        let mut params = vec![&mut self.weight];
        if let Some(b) = &mut self.bias {
            params.push(b);
        }
        params
    }

    pub fn state_dict(&self) -> StateDict {
        let mut sd = StateDict::new();
        sd.insert_trainable("weight", &self.weight);
        if let Some(b) = &self.bias {
            sd.insert_trainable("bias", b);
        }
        sd
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        let weight = sd.tensor("weight")?;
        ensure_shape("weight", &self.geom.weight_shape(), &weight.shape)?;
        let bias = load_bias(sd, &self.geom, self.has_bias())?;
        *self.weight.tensor_mut() = weight;
        if let (Some(slot), Some(b)) = (self.bias.as_mut(), bias) {
            *slot.tensor_mut() = b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubnetError;
    use crate::tape::with_tape;

    #[test]
    fn test_shapes_with_groups() {
        let geom = Conv2dGeometry::new(4, 6, 3).with_groups(2);
        let cfg = SubnetConfig::with_k(0.5).unwrap().seeded(1);
        let c = Conv2dSubnet::new(geom, true, &cfg).unwrap();
        assert_eq!(c.weight().shape(), &[6, 2, 3, 3]);
        assert_eq!(c.scores().shape(), &[6, 2, 3, 3]);
        assert_eq!(c.bias().unwrap().shape(), &[6]);
    }

    #[test]
    fn test_invalid_groups_fail_fast() {
        let geom = Conv2dGeometry::new(3, 6, 3).with_groups(2);
        let cfg = SubnetConfig::default();
        assert!(matches!(Conv2dSubnet::new(geom, false, &cfg), Err(SubnetError::InvalidConv(_))));
    }

    #[test]
    fn test_forward_applies_bias() {
        // 1x1 conv, single channel: out = w_eff * x + b
        let geom = Conv2dGeometry::new(1, 1, 1);
        let weight = Tensor::from_vec(vec![2.0], &[1, 1, 1, 1]).unwrap();
        let scores = Tensor::from_vec(vec![0.7], &[1, 1, 1, 1]).unwrap();
        let bias = Tensor::from_vec(vec![0.5], &[1]).unwrap();
        let c = Conv2dSubnet::from_parts(geom, RetainFraction::FULL, weight, Some(bias), scores).unwrap();
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let y = c.forward(&x).unwrap();
        assert_eq!(y.shape, vec![1, 1, 2, 2]);
        assert_eq!(y.data, vec![2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn test_masked_taps_do_not_contribute() {
        // Two input channels, k = 0.5 keeps only the larger-|score| tap.
        let geom = Conv2dGeometry::new(2, 1, 1);
        let weight = Tensor::from_vec(vec![10.0, 1.0], &[1, 2, 1, 1]).unwrap();
        let scores = Tensor::from_vec(vec![0.1, -3.0], &[1, 2, 1, 1]).unwrap();
        let k = RetainFraction::new(0.5).unwrap();
        let c = Conv2dSubnet::from_parts(geom, k, weight, None, scores).unwrap();
        let x = Tensor::from_vec(vec![1.0, 1.0], &[1, 2, 1, 1]).unwrap();
        assert_eq!(c.forward(&x).unwrap().data, vec![1.0]);
    }

    #[test]
    fn test_traced_matches_untracked() {
        let geom = Conv2dGeometry::new(2, 3, 3).with_padding(1).with_stride(2);
        let cfg = SubnetConfig::with_k(0.4).unwrap().seeded(11);
        let c = Conv2dSubnet::new(geom, true, &cfg).unwrap();
        let x = Tensor::from_vec((0..2 * 2 * 5 * 5).map(|i| (i as f32 * 0.13).sin()).collect(), &[2, 2, 5, 5]).unwrap();
        let y = c.forward(&x).unwrap();
        assert_eq!(y.shape, vec![2, 3, 3, 3]);
        let traced = with_tape(|tape| {
            let xid = tape.register_input(&x);
            let out = c.forward_traced(tape, xid).unwrap();
            tape.to_tensor(out)
        });
        assert_eq!(traced, y);
    }

    #[test]
    fn test_wrong_input_channels() {
        let c = Conv2dSubnet::new(Conv2dGeometry::new(3, 2, 1), false, &SubnetConfig::default()).unwrap();
        assert!(c.forward(&Tensor::zeros(&[1, 2, 4, 4])).is_err());
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let geom = Conv2dGeometry::new(2, 2, 2);
        let a = Conv2dSubnet::new(geom, true, &SubnetConfig::default().seeded(1)).unwrap();
        let mut b = Conv2dSubnet::new(geom, true, &SubnetConfig::default().seeded(2)).unwrap();
        assert_ne!(a.weight(), b.weight());
        b.load_state_dict(&a.state_dict()).unwrap();
        assert_eq!(a.weight(), b.weight());
        assert_eq!(a.bias(), b.bias());
        assert_eq!(a.scores().tensor(), b.scores().tensor());
    }

    #[test]
    fn test_load_state_dict_keeps_param_ids() {
        let geom = Conv2dGeometry::new(2, 3, 3);
        let src = Conv2dSubnet::new(geom, true, &SubnetConfig::default().seeded(1)).unwrap();
        let mut dst = Conv2dSubnet::new(geom, true, &SubnetConfig::default().seeded(2)).unwrap();
        let id = dst.scores().id();
        dst.load_state_dict(&src.state_dict()).unwrap();
        assert_eq!(dst.scores().id(), id);
        assert_eq!(dst.state_dict(), src.state_dict());

        let mut dense = DenseConv2d::new(geom, true, Some(3)).unwrap();
        let weight_id = dense.weight().id();
        dense.load_state_dict(&DenseConv2d::new(geom, true, Some(4)).unwrap().state_dict()).unwrap();
        assert_eq!(dense.weight().id(), weight_id);
    }

    #[test]
    fn test_load_rejects_wrong_scores_shape() {
        let mut c = Conv2dSubnet::new(Conv2dGeometry::new(2, 3, 3), false, &SubnetConfig::default().seeded(1)).unwrap();
        let before = c.state_dict();
        let mut sd = before.clone();
        sd.insert_trainable("popup_scores", &Trainable::new(Tensor::zeros(&[3, 2, 2, 2])));
        assert!(matches!(c.load_state_dict(&sd), Err(SubnetError::ShapeMismatch { .. })));
        assert_eq!(c.state_dict(), before);
    }

    #[test]
    fn test_dense_conv_forward_shape() {
        let d = DenseConv2d::new(Conv2dGeometry::new(1, 4, 3), true, Some(0)).unwrap();
        let y = d.forward(&Tensor::zeros(&[2, 1, 6, 6])).unwrap();
        assert_eq!(y.shape, vec![2, 4, 4, 4]);
    }
}

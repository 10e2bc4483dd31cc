/// Linear layers: the dense baseline and its masked (subnet) counterpart.
///
/// `LinearSubnet` holds a frozen weight [out, in], an optional frozen bias
/// [out], and trainable `popup_scores` with the weight's shape. Each forward
/// derives a fresh mask from |scores|, multiplies it into the weight and
/// applies `x @ (weight ⊙ mask)^T`.
///
/// The bias is allocated and persisted but NOT applied in the forward pass.
/// `Conv2dSubnet` does apply its bias. Both behaviours are kept as-is and
/// covered by tests.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::StateDict;
use crate::config::SubnetConfig;
use crate::error::{Result, SubnetError};
use crate::init::{self, Initializer};
use crate::params::{Frozen, RetainFraction, Trainable};
use crate::subnet;
use crate::tape::{BufId, Tape};
use crate::tensor::{self, ensure_shape, Tensor};
use crate::traced;

/// Constructor attributes shared by dense and masked linear layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub in_features: usize,
    pub out_features: usize,
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        LinearConfig { in_features, out_features, bias }
    }

    pub fn weight_shape(&self) -> [usize; 2] {
        [self.out_features, self.in_features]
    }
}

/// Split x: [.., in] into (rows, output shape [.., out]).
fn linear_io(x_shape: &[usize], cfg: &LinearConfig) -> Result<(usize, Vec<usize>)> {
    if x_shape.last() != Some(&cfg.in_features) {
        return Err(SubnetError::ShapeMismatch {
            what: "linear input trailing dimension",
            expected: vec![cfg.in_features],
            actual: x_shape.to_vec(),
        });
    }
    let rows: usize = x_shape[..x_shape.len() - 1].iter().product();
    let mut out_shape = x_shape[..x_shape.len() - 1].to_vec();
    out_shape.push(cfg.out_features);
    Ok((rows, out_shape))
}

fn new_bias(cfg: &LinearConfig, rng: &mut StdRng) -> Result<Option<Tensor>> {
    if !cfg.bias {
        return Ok(None);
    }
    let mut bias = Tensor::zeros(&[cfg.out_features]);
    init::dense_bias_init(&mut bias, &cfg.weight_shape(), rng)?;
    Ok(Some(bias))
}

/// Traced `x @ w^T` for x of any leading shape; flattens to 2-D and back.
fn traced_linear(tape: &mut Tape, x: BufId, w: BufId, cfg: &LinearConfig) -> Result<BufId> {
    let (rows, out_shape) = linear_io(tape.buf_shape(x), cfg)?;
    let x2 = if tape.buf_shape(x).len() == 2 {
        x
    } else {
        traced::traced_reshape(tape, x, vec![rows, cfg.in_features])
    };
    let y = traced::traced_matmul_transpose_b(tape, x2, w, rows, cfg.in_features, cfg.out_features);
    Ok(if out_shape.len() == 2 { y } else { traced::traced_reshape(tape, y, out_shape) })
}

// ── Masked linear ────────────────────────────────────────────────────

/// Linear layer whose active weights are selected by learned scores.
#[derive(Clone, Debug)]
pub struct LinearSubnet {
    config: LinearConfig,
    k: RetainFraction,
    weight: Frozen,
    bias: Option<Frozen>,
    popup_scores: Trainable,
}

impl LinearSubnet {
    /// Build with the config's retain fraction, initializer and seed.
    pub fn new(config: LinearConfig, subnet: &SubnetConfig) -> Result<Self> {
        let mut rng = init::make_rng(subnet.seed);
        Self::with_initializer(config, subnet.k, &subnet.init, &mut rng)
    }

    /// Build with an explicit weight initializer.
    ///
    /// Bias follows the dense convention; scores are unscaled N(0, 1);
    /// the weight is filled by `init` for retain fraction `k`.
    pub fn with_initializer(
        config: LinearConfig,
        k: RetainFraction,
        init: &dyn Initializer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let shape = config.weight_shape();
        let bias = new_bias(&config, rng)?;
        let scores = init::randn(&shape, rng);
        let mut weight = Tensor::zeros(&shape);
        init.initialize(&mut weight, k, rng)?;
        debug!(in_features = config.in_features, out_features = config.out_features,
               bias = config.bias, k = k.get(), "constructed LinearSubnet");
        Ok(LinearSubnet {
            config,
            k,
            weight: Frozen::new(weight),
            bias: bias.map(Frozen::new),
            popup_scores: Trainable::new(scores),
        })
    }

    /// Assemble from existing tensors. The weight must be 2-D, scores must
    /// match it exactly, and the bias (if any) must be [out].
    pub fn from_parts(k: RetainFraction, weight: Tensor, bias: Option<Tensor>, scores: Tensor) -> Result<Self> {
        if weight.shape.len() != 2 {
            return Err(SubnetError::InvalidShape {
                shape: weight.shape.clone(),
                reason: "linear weight must be [out, in]".into(),
            });
        }
        let config = LinearConfig::new(weight.shape[1], weight.shape[0], bias.is_some());
        ensure_shape("popup_scores", &weight.shape, &scores.shape)?;
        if let Some(b) = &bias {
            ensure_shape("bias", &[config.out_features], &b.shape)?;
        }
        Ok(LinearSubnet {
            config,
            k,
            weight: Frozen::new(weight),
            bias: bias.map(Frozen::new),
            popup_scores: Trainable::new(scores),
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
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

    /// The mask the next forward call would use.
    pub fn mask(&self) -> Tensor {
        subnet::get_subnet(&self.popup_scores.tensor().abs(), self.k)
    }

    /// Untracked forward: x [.., in] → [.., out]. The bias is not applied.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (rows, out_shape) = linear_io(&x.shape, &self.config)?;
        let mask = self.mask();
        let mut w_eff = vec![0.0f32; mask.numel()];
        tensor::mul_f32(&self.weight.tensor().data, &mask.data, &mut w_eff);
        let mut out = vec![0.0f32; rows * self.config.out_features];
        tensor::matmul_transpose_b_f32(&x.data, &w_eff, &mut out, rows, self.config.in_features, self.config.out_features);
        Tensor::from_vec(out, &out_shape)
    }

    /// Traced forward: scores → abs → mask → weight ⊙ mask → x @ w_eff^T.
    pub fn forward_traced(&self, tape: &mut Tape, x: BufId) -> Result<BufId> {
        let s = tape.register_trainable(&self.popup_scores);
        let s_abs = traced::traced_abs(tape, s);
        let mask = traced::traced_get_subnet(tape, s_abs, self.k);
        let w = tape.register_frozen(&self.weight);
        let w_eff = traced::traced_mul(tape, w, mask);
        traced_linear(tape, x, w_eff, &self.config)
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

    /// Restore tensors from a state dict in place, so the scores keep their
    /// `ParamId` and optimizer state. The layer keeps its retain fraction;
    /// the bias entry is required exactly when the layer has a bias. Nothing
    /// is written unless every entry is present and shaped correctly.
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        let shape = self.config.weight_shape();
        let weight = sd.tensor("weight")?;
        ensure_shape("weight", &shape, &weight.shape)?;
        let scores = sd.tensor("popup_scores")?;
        ensure_shape("popup_scores", &shape, &scores.shape)?;
        let bias = match self.bias {
            Some(_) => {
                let b = sd.tensor("bias")?;
                ensure_shape("bias", &[self.config.out_features], &b.shape)?;
                Some(b)
            }
            None => None,
        };
        self.weight.overwrite(weight);
        if let (Some(slot), Some(b)) = (self.bias.as_mut(), bias) {
            slot.overwrite(b);
        }
        *self.popup_scores.tensor_mut() = scores;
        Ok(())
    }
}

// ── Dense linear ─────────────────────────────────────────────────────

/// Standard linear layer `x @ W^T + b` with trainable weight and bias.
/// Exists as the source layer type for model surgery.
#[derive(Clone, Debug)]
pub struct DenseLinear {
    config: LinearConfig,
    weight: Trainable,
    bias: Option<Trainable>,
}

impl DenseLinear {
    pub fn new(config: LinearConfig, seed: Option<u64>) -> Result<Self> {
        let mut rng = init::make_rng(seed);
        let mut weight = Tensor::zeros(&config.weight_shape());
        init::dense_weight_init(&mut weight, &mut rng)?;
        let bias = new_bias(&config, &mut rng)?;
        Ok(DenseLinear { config, weight: Trainable::new(weight), bias: bias.map(Trainable::new) })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Trainable {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (rows, out_shape) = linear_io(&x.shape, &self.config)?;
        let n = self.config.out_features;
        let mut out = vec![0.0f32; rows * n];
        tensor::matmul_transpose_b_f32(&x.data, &self.weight.tensor().data, &mut out, rows, self.config.in_features, n);
        if let Some(b) = &self.bias {
            for (i, o) in out.iter_mut().enumerate() {
                *o += b.tensor().data[i % n];
            }
        }
        Tensor::from_vec(out, &out_shape)
    }

    pub fn forward_traced(&self, tape: &mut Tape, x: BufId) -> Result<BufId> {
        let w = tape.register_trainable(&self.weight);
        let y = traced_linear(tape, x, w, &self.config)?;
        let Some(bias) = &self.bias else { return Ok(y) };
        let b = tape.register_trainable(bias);
        let n = self.config.out_features;
        let rows = tape.buf_numel(y) / n.max(1);
        Ok(traced::traced_add_row_bias(tape, y, b, rows, n))
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
        ensure_shape("weight", &self.config.weight_shape(), &weight.shape)?;
        let bias = match self.bias {
            Some(_) => {
                let b = sd.tensor("bias")?;
                ensure_shape("bias", &[self.config.out_features], &b.shape)?;
                Some(b)
            }
            None => None,
        };
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
    use crate::tape::with_tape;

    fn layer(k: f64, bias: bool) -> LinearSubnet {
        let cfg = SubnetConfig::with_k(k).unwrap().seeded(3);
        LinearSubnet::new(LinearConfig::new(4, 3, bias), &cfg).unwrap()
    }

    #[test]
    fn test_shapes() {
        let l = layer(0.5, true);
        assert_eq!(l.weight().shape(), &[3, 4]);
        assert_eq!(l.scores().shape(), &[3, 4]);
        assert_eq!(l.bias().unwrap().shape(), &[3]);
        assert!(layer(0.5, false).bias().is_none());
    }

    #[test]
    fn test_weight_within_scaled_bound() {
        let l = layer(0.25, false);
        // relu gain sqrt(2), fan_in 4, k 0.25 → sqrt(2)/2/0.5 = sqrt(2)
        let bound = 2.0f32.sqrt() + 1e-6;
        assert!(l.weight().tensor().data.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_mask_cardinality() {
        let l = layer(0.5, false);
        let m = l.mask();
        assert_eq!(m.data.iter().filter(|&&v| v == 1.0).count(), 6);
    }

    #[test]
    fn test_forward_uses_masked_weight_and_ignores_bias() {
        let weight = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let scores = Tensor::from_vec(vec![0.9, -0.1, 0.2, -0.8], &[2, 2]).unwrap();
        let bias = Tensor::from_vec(vec![100.0, 100.0], &[2]).unwrap();
        let k = RetainFraction::new(0.5).unwrap();
        let l = LinearSubnet::from_parts(k, weight, Some(bias), scores).unwrap();
        // |scores| = [0.9, 0.1, 0.2, 0.8] → mask [1, 0, 0, 1] → w_eff [[1, 0], [0, 4]]
        let x = Tensor::from_vec(vec![1.0, 1.0, 2.0, -1.0], &[2, 2]).unwrap();
        let y = l.forward(&x).unwrap();
        assert_eq!(y.shape, vec![2, 2]);
        assert_eq!(y.data, vec![1.0, 4.0, 2.0, -4.0]);
    }

    #[test]
    fn test_forward_leading_dims() {
        let l = layer(0.5, false);
        let x = Tensor::from_vec((0..24).map(|i| i as f32 * 0.1).collect(), &[2, 3, 4]).unwrap();
        let y = l.forward(&x).unwrap();
        assert_eq!(y.shape, vec![2, 3, 3]);
        let traced = with_tape(|tape| {
            let xid = tape.register_input(&x);
            let out = l.forward_traced(tape, xid).unwrap();
            tape.to_tensor(out)
        });
        assert_eq!(traced, y);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let l = layer(0.5, false);
        let x = Tensor::zeros(&[2, 5]);
        assert!(matches!(l.forward(&x), Err(SubnetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_from_parts_shape_checks() {
        let k = RetainFraction::FULL;
        let w = Tensor::zeros(&[2, 3]);
        assert!(LinearSubnet::from_parts(k, w.clone(), None, Tensor::zeros(&[3, 2])).is_err());
        assert!(LinearSubnet::from_parts(k, w.clone(), Some(Tensor::zeros(&[3])), Tensor::zeros(&[2, 3])).is_err());
        assert!(LinearSubnet::from_parts(k, Tensor::zeros(&[6]), None, Tensor::zeros(&[6])).is_err());
        assert!(LinearSubnet::from_parts(k, w, None, Tensor::zeros(&[2, 3])).is_ok());
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let l = layer(0.5, true);
        let sd = l.state_dict();
        let names: Vec<&str> = sd.names().collect();
        assert_eq!(names, vec!["bias", "popup_scores", "weight"]);

        let other_cfg = SubnetConfig::with_k(0.5).unwrap().seeded(99);
        let mut other = LinearSubnet::new(LinearConfig::new(4, 3, true), &other_cfg).unwrap();
        assert_ne!(other.weight(), l.weight());
        other.load_state_dict(&sd).unwrap();
        assert_eq!(other.weight(), l.weight());
        assert_eq!(other.bias(), l.bias());
        assert_eq!(other.scores().tensor(), l.scores().tensor());
    }

    #[test]
    fn test_load_state_dict_missing_bias() {
        let mut l = layer(0.5, true);
        let sd = layer(0.5, false).state_dict();
        assert!(matches!(l.load_state_dict(&sd), Err(SubnetError::MissingTensor(n)) if n == "bias"));
    }

    #[test]
    fn test_load_state_dict_keeps_param_ids() {
        let mut l = layer(0.5, true);
        let id = l.scores().id();
        let sd = layer(0.5, true).state_dict();
        l.load_state_dict(&sd).unwrap();
        assert_eq!(l.scores().id(), id);
        assert_eq!(l.scores().tensor(), &sd.tensor("popup_scores").unwrap());
        assert_eq!(l.bias().unwrap().tensor(), &sd.tensor("bias").unwrap());
    }

    #[test]
    fn test_failed_load_leaves_layer_untouched() {
        let mut l = layer(0.5, true);
        let before = l.state_dict();
        let mut sd = layer(0.5, true).state_dict();
        sd.insert_frozen("bias", &Frozen::new(Tensor::zeros(&[7])));
        assert!(matches!(l.load_state_dict(&sd), Err(SubnetError::ShapeMismatch { .. })));
        assert_eq!(l.state_dict(), before);
    }

    #[test]
    fn test_unrepresentable_bound_is_an_error() {
        let cfg = SubnetConfig { k: RetainFraction::new(1e-80).unwrap(), ..SubnetConfig::default() }.seeded(1);
        let err = LinearSubnet::new(LinearConfig::new(4, 2, false), &cfg);
        assert!(matches!(err, Err(SubnetError::InitBound(_))));
    }

    #[test]
    fn test_dense_linear_applies_bias() {
        let d = DenseLinear::new(LinearConfig::new(3, 2, true), Some(5)).unwrap();
        let x = Tensor::zeros(&[4, 3]);
        let y = d.forward(&x).unwrap();
        let b = d.state_dict().tensor("bias").unwrap();
        for r in 0..4 {
            assert_eq!(&y.data[r * 2..r * 2 + 2], &b.data[..]);
        }
    }
}

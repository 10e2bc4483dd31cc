/// Weight initialization.
///
/// The sparsity-scaled initializer draws from Uniform(-b, b) with
///
///   b = gain(nonlinearity) / sqrt(fan) / sqrt(k)
///
/// The 1/sqrt(k) factor keeps the variance of the masked weighted sum at the
/// level a dense layer would have, since only a k-fraction of the weights
/// survive the mask.
///
/// The dense conventions (`dense_weight_init`, `dense_bias_init`) and the
/// unscaled normal used for scores live here too.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubnetError};
use crate::params::RetainFraction;
use crate::tensor::Tensor;

/// Which connection count scales the variance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    #[default]
    FanIn,
    FanOut,
}

/// Nonlinearity following the layer, selecting the recommended gain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nonlinearity {
    Linear,
    Conv,
    Sigmoid,
    Tanh,
    #[default]
    Relu,
    LeakyRelu { negative_slope: f64 },
    Selu,
}

impl Nonlinearity {
    pub fn gain(self) -> f64 {
        match self {
            Nonlinearity::Linear | Nonlinearity::Conv | Nonlinearity::Sigmoid => 1.0,
            Nonlinearity::Tanh => 5.0 / 3.0,
            Nonlinearity::Relu => 2.0f64.sqrt(),
            Nonlinearity::LeakyRelu { negative_slope } => {
                (2.0 / (1.0 + negative_slope * negative_slope)).sqrt()
            }
            Nonlinearity::Selu => 0.75,
        }
    }
}

/// (fan_in, fan_out) for a weight of shape [out, in, *receptive_field].
pub fn calculate_fans(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() < 2 {
        return Err(SubnetError::InvalidShape {
            shape: shape.to_vec(),
            reason: "fan needs at least 2 dimensions".into(),
        });
    }
    let receptive: usize = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}

pub fn calculate_fan(shape: &[usize], mode: FanMode) -> Result<usize> {
    let (fan_in, fan_out) = calculate_fans(shape)?;
    Ok(match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    })
}

/// Build an RNG from an optional seed; unseeded draws come from OS entropy.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// ── Sparsity-scaled uniform ──────────────────────────────────────────

/// Initializer hook used by the masked layers at construction.
pub trait Initializer {
    /// Overwrite `tensor` in place for a layer that keeps fraction `k`.
    fn initialize(&self, tensor: &mut Tensor, k: RetainFraction, rng: &mut StdRng) -> Result<()>;
}

/// Uniform(-b, b) with b = gain / sqrt(fan) / sqrt(k).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityScaledUniform {
    #[serde(default)]
    pub mode: FanMode,
    #[serde(default)]
    pub nonlinearity: Nonlinearity,
}

impl SparsityScaledUniform {
    pub fn new(mode: FanMode, nonlinearity: Nonlinearity) -> Self {
        SparsityScaledUniform { mode, nonlinearity }
    }

    /// The distribution bound for a tensor of `shape` at retain fraction `k`.
    pub fn bound(&self, shape: &[usize], k: RetainFraction) -> Result<f64> {
        let fan = calculate_fan(shape, self.mode)?;
        if fan == 0 {
            return Err(SubnetError::InvalidShape {
                shape: shape.to_vec(),
                reason: "fan is zero".into(),
            });
        }
        let std = self.nonlinearity.gain() / (fan as f64).sqrt();
        let bound = std / k.get().sqrt();
        check_bound(bound as f32)?;
        Ok(bound)
    }
}

impl Initializer for SparsityScaledUniform {
    fn initialize(&self, tensor: &mut Tensor, k: RetainFraction, rng: &mut StdRng) -> Result<()> {
        let bound = self.bound(&tensor.shape, k)?;
        fill_uniform(&mut tensor.data, bound as f32, rng)
    }
}

// ── Dense conventions ────────────────────────────────────────────────

/// `Uniform::new(-b, b)` needs both ends and the width 2b finite.
fn check_bound(bound: f32) -> Result<()> {
    if bound.is_nan() || !(2.0 * bound).is_finite() {
        return Err(SubnetError::InitBound(bound as f64));
    }
    Ok(())
}

/// Fill with independent Uniform(-bound, bound) draws.
pub fn fill_uniform(buf: &mut [f32], bound: f32, rng: &mut StdRng) -> Result<()> {
    check_bound(bound)?;
    if bound <= 0.0 {
        buf.fill(0.0);
        return Ok(());
    }
    let dist = Uniform::new(-bound, bound);
    for v in buf.iter_mut() {
        *v = dist.sample(rng);
    }
    Ok(())
}

/// Unscaled standard normal tensor. Scores start from this distribution.
pub fn randn(shape: &[usize], rng: &mut StdRng) -> Tensor {
    let mut t = Tensor::zeros(shape);
    for v in t.data.iter_mut() {
        *v = StandardNormal.sample(rng);
    }
    t
}

/// Default dense-layer weight init: Kaiming uniform with a = sqrt(5),
/// which reduces to Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)).
pub fn dense_weight_init(tensor: &mut Tensor, rng: &mut StdRng) -> Result<()> {
    let (fan_in, _) = calculate_fans(&tensor.shape)?;
    let bound = if fan_in > 0 { 1.0 / (fan_in as f32).sqrt() } else { 0.0 };
    fill_uniform(&mut tensor.data, bound, rng)
}

/// Default dense-layer bias init: Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)).
pub fn dense_bias_init(bias: &mut Tensor, weight_shape: &[usize], rng: &mut StdRng) -> Result<()> {
    let (fan_in, _) = calculate_fans(weight_shape)?;
    let bound = if fan_in > 0 { 1.0 / (fan_in as f32).sqrt() } else { 0.0 };
    fill_uniform(&mut bias.data, bound, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::std_f32;

    fn k(v: f64) -> RetainFraction {
        RetainFraction::new(v).unwrap()
    }

    #[test]
    fn test_fans_linear_and_conv() {
        assert_eq!(calculate_fans(&[2, 4]).unwrap(), (4, 2));
        assert_eq!(calculate_fans(&[8, 3, 3, 3]).unwrap(), (27, 72));
        assert_eq!(calculate_fan(&[8, 3, 3, 3], FanMode::FanOut).unwrap(), 72);
        assert!(calculate_fans(&[5]).is_err());
    }

    #[test]
    fn test_gains() {
        assert_eq!(Nonlinearity::Linear.gain(), 1.0);
        assert!((Nonlinearity::Relu.gain() - 2.0f64.sqrt()).abs() < 1e-12);
        assert!((Nonlinearity::Tanh.gain() - 5.0 / 3.0).abs() < 1e-12);
        let leaky = Nonlinearity::LeakyRelu { negative_slope: 0.0 };
        assert!((leaky.gain() - Nonlinearity::Relu.gain()).abs() < 1e-12);
        assert_eq!(Nonlinearity::Selu.gain(), 0.75);
    }

    #[test]
    fn test_bound_formula() {
        let init = SparsityScaledUniform::default();
        // gain sqrt(2), fan_in 8, k 0.5 → sqrt(2)/sqrt(8)/sqrt(0.5) = 0.5*sqrt(2)
        let b = init.bound(&[4, 8], k(0.5)).unwrap();
        assert!((b - 0.5 * 2.0f64.sqrt()).abs() < 1e-12, "bound={b}");
    }

    #[test]
    fn test_halving_k_scales_bound_by_sqrt2() {
        let init = SparsityScaledUniform::new(FanMode::FanIn, Nonlinearity::Linear);
        let b1 = init.bound(&[16, 16], k(0.4)).unwrap();
        let b2 = init.bound(&[16, 16], k(0.2)).unwrap();
        assert!((b2 / b1 - 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_samples_within_bound_and_std_scales() {
        let init = SparsityScaledUniform::new(FanMode::FanIn, Nonlinearity::Relu);
        let shape = [256, 256];
        let mut rng = make_rng(Some(7));

        let mut t1 = Tensor::zeros(&shape);
        init.initialize(&mut t1, k(0.5), &mut rng).unwrap();
        let b1 = init.bound(&shape, k(0.5)).unwrap() as f32;
        assert!(t1.data.iter().all(|v| v.abs() <= b1));

        let mut t2 = Tensor::zeros(&shape);
        init.initialize(&mut t2, k(0.25), &mut rng).unwrap();

        // Uniform(-b, b) has std b/sqrt(3); with 65536 draws the ratio is tight.
        let ratio = std_f32(&t2.data) / std_f32(&t1.data);
        assert!((ratio - 2.0f32.sqrt()).abs() < 0.02, "ratio={ratio}");
        let expected = b1 / 3.0f32.sqrt();
        assert!((std_f32(&t1.data) - expected).abs() / expected < 0.02);
    }

    #[test]
    fn test_initialize_rejects_vector() {
        let mut t = Tensor::zeros(&[10]);
        let mut rng = make_rng(Some(0));
        let err = SparsityScaledUniform::default().initialize(&mut t, k(0.5), &mut rng);
        assert!(matches!(err, Err(SubnetError::InvalidShape { .. })));
    }

    #[test]
    fn test_overflowing_bound_is_an_error() {
        // 1/sqrt(1e-80) = 1e40 overflows f32.
        let init = SparsityScaledUniform::default();
        assert!(matches!(init.bound(&[2, 4], k(1e-80)), Err(SubnetError::InitBound(_))));
        let mut t = Tensor::zeros(&[2, 4]);
        let err = init.initialize(&mut t, k(1e-80), &mut make_rng(Some(1)));
        assert!(matches!(err, Err(SubnetError::InitBound(_))));
        // Finite as f32 but 2b overflows.
        assert!(matches!(fill_uniform(&mut [0.0; 4], f32::MAX, &mut make_rng(Some(1))), Err(SubnetError::InitBound(_))));
    }

    #[test]
    fn test_nan_gain_is_an_error() {
        let init = SparsityScaledUniform::new(FanMode::FanIn, Nonlinearity::LeakyRelu { negative_slope: f64::NAN });
        assert!(matches!(init.bound(&[2, 4], k(0.5)), Err(SubnetError::InitBound(_))));
    }

    #[test]
    fn test_randn_deterministic() {
        let a = randn(&[3, 4], &mut make_rng(Some(42)));
        let b = randn(&[3, 4], &mut make_rng(Some(42)));
        assert_eq!(a, b);
        assert_eq!(a.shape, vec![3, 4]);
    }

    #[test]
    fn test_dense_bias_bound() {
        let mut rng = make_rng(Some(1));
        let mut bias = Tensor::zeros(&[64]);
        dense_bias_init(&mut bias, &[64, 16], &mut rng).unwrap();
        assert!(bias.data.iter().all(|v| v.abs() <= 0.25));
        assert!(bias.data.iter().any(|&v| v != 0.0));
    }
}

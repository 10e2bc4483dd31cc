/// Optimizers over trainable parameters.
///
/// State is keyed by `ParamId`, so one optimizer can drive any set of
/// trainables across steps. A parameter with no gradient in `grads` is left
/// untouched and its state does not advance. Frozen tensors have no
/// `&mut Trainable` form and cannot reach an optimizer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::params::{Gradients, ParamId, Trainable};

pub trait Optimizer {
    fn step(&mut self, params: &mut [&mut Trainable], grads: &Gradients);
}

// ── SGD ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f32,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub weight_decay: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        SgdConfig { lr: 0.1, momentum: 0.0, weight_decay: 0.0 }
    }
}

/// SGD with optional heavy-ball momentum and L2 weight decay.
#[derive(Clone, Debug, Default)]
pub struct Sgd {
    pub config: SgdConfig,
    velocity: HashMap<ParamId, Vec<f32>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Sgd { config, velocity: HashMap::new() }
    }
}

fn sgd_step_buf(params: &mut [f32], grads: &[f32], vel: Option<&mut Vec<f32>>, c: &SgdConfig) {
    debug_assert_eq!(params.len(), grads.len());
    match vel {
        Some(vel) => {
            for i in 0..params.len() {
                let g = grads[i] + c.weight_decay * params[i];
                vel[i] = c.momentum * vel[i] + g;
                params[i] -= c.lr * vel[i];
            }
        }
        None => {
            for i in 0..params.len() {
                params[i] -= c.lr * (grads[i] + c.weight_decay * params[i]);
            }
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Trainable], grads: &Gradients) {
        for p in params.iter_mut() {
            let Some(g) = grads.get(p) else { continue };
            let id = p.id();
            let vel = if self.config.momentum != 0.0 {
                Some(self.velocity.entry(id).or_insert_with(|| vec![0.0; g.len()]))
            } else {
                None
            };
            sgd_step_buf(&mut p.tensor_mut().data, g, vel, &self.config);
        }
    }
}

// ── AdamW ────────────────────────────────────────────────────────────

/// AdamW hyperparameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers plus the step count used for bias correction.
#[derive(Clone, Debug)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
    step: u32,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n], step: 0 }
    }
}

/// AdamW with decoupled weight decay. Each parameter counts its own steps,
/// so one that skipped updates gets bias correction for the updates it saw.
#[derive(Clone, Debug, Default)]
pub struct AdamW {
    pub config: AdamWConfig,
    state: HashMap<ParamId, MomentBuf>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        AdamW { config, state: HashMap::new() }
    }

    /// Number of updates applied to `param` so far.
    pub fn steps_for(&self, param: &Trainable) -> u32 {
        self.state.get(&param.id()).map_or(0, |s| s.step)
    }
}

/// Core AdamW step on a single (params, grads, m, v) group.
#[inline]
#[allow(clippy::too_many_arguments)]
fn adamw_step_buf(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    bc1_inv: f32,
    bc2_inv: f32,
    weight_decay: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
        let m_hat = m[i] * bc1_inv;
        let v_hat = v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + eps) + weight_decay * params[i]);
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Trainable], grads: &Gradients) {
        let c = self.config;
        for p in params.iter_mut() {
            let Some(g) = grads.get(p) else { continue };
            let buf = self.state.entry(p.id()).or_insert_with(|| MomentBuf::zeros(g.len()));
            buf.step += 1;
            let t = buf.step as f32;
            let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
            let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));
            adamw_step_buf(&mut p.tensor_mut().data, g, &mut buf.m, &mut buf.v,
                           c.lr, c.beta1, c.beta2, c.eps, bc1_inv, bc2_inv, c.weight_decay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn param(v: &[f32]) -> Trainable {
        Trainable::new(Tensor::from_vec(v.to_vec(), &[v.len()]).unwrap())
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_sgd_plain_step() {
        let mut p = param(&[1.0, -2.0]);
        let mut grads = Gradients::new();
        grads.insert(p.id(), vec![0.5, -1.0]);
        let mut opt = Sgd::new(SgdConfig { lr: 0.1, ..SgdConfig::default() });
        opt.step(&mut [&mut p], &grads);
        assert_close(&p.tensor().data, &[0.95, -1.9], 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut p = param(&[0.0]);
        let mut grads = Gradients::new();
        grads.insert(p.id(), vec![1.0]);
        let mut opt = Sgd::new(SgdConfig { lr: 1.0, momentum: 0.5, weight_decay: 0.0 });
        opt.step(&mut [&mut p], &grads);
        opt.step(&mut [&mut p], &grads);
        // v1 = 1, v2 = 1.5 → p = -2.5
        assert_close(&p.tensor().data, &[-2.5], 1e-6);
    }

    #[test]
    fn test_missing_grad_skipped() {
        let mut a = param(&[1.0]);
        let mut b = param(&[1.0]);
        let mut grads = Gradients::new();
        grads.insert(a.id(), vec![1.0]);
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut [&mut a, &mut b], &grads);
        assert_ne!(a.tensor().data[0], 1.0);
        assert_eq!(b.tensor().data[0], 1.0);
        assert_eq!(opt.steps_for(&a), 1);
        assert_eq!(opt.steps_for(&b), 0);
    }

    #[test]
    fn test_adamw_first_step_is_lr_sign() {
        // Bias-corrected first step: m_hat = g, v_hat = g², update ≈ lr * sign(g).
        let mut p = param(&[0.0, 0.0]);
        let mut grads = Gradients::new();
        grads.insert(p.id(), vec![3.0, -0.01]);
        let mut opt = AdamW::new(AdamWConfig { lr: 0.01, ..AdamWConfig::default() });
        opt.step(&mut [&mut p], &grads);
        assert_close(&p.tensor().data, &[-0.01, 0.01], 1e-5);
    }

    #[test]
    fn test_adamw_weight_decay_without_grad_signal() {
        let mut p = param(&[2.0]);
        let mut grads = Gradients::new();
        grads.insert(p.id(), vec![0.0]);
        let mut opt = AdamW::new(AdamWConfig { lr: 0.1, weight_decay: 0.5, ..AdamWConfig::default() });
        opt.step(&mut [&mut p], &grads);
        assert_close(&p.tensor().data, &[1.9], 1e-6);
    }
}

/// Parameter roles.
///
/// Freezing is expressed in the type system instead of a runtime flag:
/// - `Frozen` tensors are written once at construction and only ever read.
/// - `Trainable` tensors carry a `ParamId` and expose mutable access for
///   optimizers.
///
/// Optimizers take `&mut Trainable`, so a frozen weight or bias cannot reach
/// them. The tape refuses gradient accumulation into frozen buffers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubnetError};
use crate::tensor::Tensor;

// ── Retain fraction ──────────────────────────────────────────────────

/// Fraction of weight positions kept active by the mask, in (0, 1].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct RetainFraction(f64);

impl RetainFraction {
    pub const FULL: RetainFraction = RetainFraction(1.0);
    pub const DEFAULT: RetainFraction = RetainFraction(crate::config::DEFAULT_K);

    pub fn new(k: f64) -> Result<Self> {
        if k > 0.0 && k <= 1.0 {
            Ok(RetainFraction(k))
        } else {
            Err(SubnetError::InvalidRetainFraction(k))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Number of positions zeroed out of `numel`: floor((1 - k) * numel).
    pub fn num_zeroed(self, numel: usize) -> usize {
        ((1.0 - self.0) * numel as f64) as usize
    }
}

impl TryFrom<f64> for RetainFraction {
    type Error = SubnetError;

    fn try_from(k: f64) -> Result<Self> {
        RetainFraction::new(k)
    }
}

impl From<RetainFraction> for f64 {
    fn from(k: RetainFraction) -> f64 {
        k.0
    }
}

// ── Frozen ───────────────────────────────────────────────────────────

/// A tensor fixed at construction. Read-only afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Frozen(Tensor);

impl Frozen {
    pub fn new(tensor: Tensor) -> Self {
        Frozen(tensor)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    /// Restore from a checkpoint. Callers check the shape first.
    pub(crate) fn overwrite(&mut self, tensor: Tensor) {
        debug_assert_eq!(self.0.shape, tensor.shape);
        self.0 = tensor;
    }
}

// ── Trainable ────────────────────────────────────────────────────────

/// Process-unique identity of a trainable tensor. Links tape gradients
/// and optimizer state back to the parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

impl ParamId {
    fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A tensor that receives gradients and is updated by an optimizer.
#[derive(Debug, PartialEq)]
pub struct Trainable {
    id: ParamId,
    value: Tensor,
}

impl Trainable {
    pub fn new(value: Tensor) -> Self {
        Trainable { id: ParamId::fresh(), value }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn tensor(&self) -> &Tensor {
        &self.value
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn shape(&self) -> &[usize] {
        &self.value.shape
    }
}

impl Clone for Trainable {
    /// A clone is a distinct parameter: it gets its own `ParamId` so that
    /// optimizer state is never shared between the copies.
    fn clone(&self) -> Self {
        Trainable::new(self.value.clone())
    }
}

// ── Gradients ────────────────────────────────────────────────────────

/// Gradients of trainable parameters, keyed by `ParamId`.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    grads: HashMap<ParamId, Vec<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Gradients::default()
    }

    pub fn insert(&mut self, id: ParamId, grad: Vec<f32>) {
        self.grads.insert(id, grad);
    }

    /// Gradient for `param`, if any flowed to it.
    pub fn get(&self, param: &Trainable) -> Option<&[f32]> {
        self.grads.get(&param.id()).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_fraction_bounds() {
        assert!(RetainFraction::new(1.0).is_ok());
        assert!(RetainFraction::new(1e-9).is_ok());
        assert!(RetainFraction::new(0.0).is_err());
        assert!(RetainFraction::new(-0.5).is_err());
        assert!(RetainFraction::new(1.5).is_err());
        assert!(RetainFraction::new(f64::NAN).is_err());
    }

    #[test]
    fn test_num_zeroed_floor() {
        let k = RetainFraction::new(0.3).unwrap();
        // (1 - 0.3) * 10 = 7.000000000000001 → 7
        assert_eq!(k.num_zeroed(10), 7);
        assert_eq!(k.num_zeroed(0), 0);
        assert_eq!(RetainFraction::FULL.num_zeroed(123), 0);
        let half = RetainFraction::new(0.5).unwrap();
        assert_eq!(half.num_zeroed(7), 3);
    }

    #[test]
    fn test_retain_fraction_serde_validates() {
        let k: RetainFraction = serde_json::from_str("0.25").unwrap();
        assert_eq!(k.get(), 0.25);
        assert!(serde_json::from_str::<RetainFraction>("0.0").is_err());
        assert_eq!(serde_json::to_string(&k).unwrap(), "0.25");
    }

    #[test]
    fn test_trainable_ids_unique() {
        let a = Trainable::new(Tensor::zeros(&[2]));
        let b = a.clone();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.tensor(), b.tensor());
    }

    #[test]
    fn test_gradients_lookup() {
        let p = Trainable::new(Tensor::zeros(&[2]));
        let q = Trainable::new(Tensor::zeros(&[2]));
        let mut g = Gradients::new();
        g.insert(p.id(), vec![1.0, 2.0]);
        assert_eq!(g.get(&p), Some(&[1.0, 2.0][..]));
        assert_eq!(g.get(&q), None);
        assert_eq!(g.len(), 1);
    }
}

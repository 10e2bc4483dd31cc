/// Top-k straight-through mask operator.
///
/// Forward: given score magnitudes `s` and retain fraction `k`, zero the
/// `j = floor((1 - k) * numel)` lowest-scoring positions and set the rest
/// to 1. Scores are ordered by a stable ascending sort, so equal scores keep
/// their flat-index order and the earlier index is zeroed first.
///
/// Backward: the incoming gradient is returned unchanged as the gradient
/// w.r.t. `s`. `k` receives no gradient.
///
/// Both halves are pure functions. The tape wires them together as
/// `TapeOp::GetSubnet`.

use std::cmp::Ordering;

use tracing::trace;

use crate::params::RetainFraction;
use crate::tensor::Tensor;

/// Ascending order with -0.0 equal to +0.0 and every NaN above every number.
fn score_order(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

/// Flat indices of `scores` in stable ascending order.
///
/// Equal scores (including -0.0 and +0.0) keep their flat-index order. NaN,
/// whatever its sign bit, sorts last, so it is never zeroed ahead of a number.
pub fn stable_argsort(scores: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    // slice::sort_by is stable.
    idx.sort_by(|&a, &b| score_order(scores[a], scores[b]));
    idx
}

/// Binary mask over flat `scores`: the `num_zeroed` lowest positions are 0.
pub fn get_subnet_forward(scores: &[f32], k: RetainFraction) -> Vec<f32> {
    let j = k.num_zeroed(scores.len());
    let order = stable_argsort(scores);
    let mut mask = vec![1.0f32; scores.len()];
    for &i in &order[..j] {
        mask[i] = 0.0;
    }
    trace!(numel = scores.len(), zeroed = j, kept = scores.len() - j, "get_subnet mask");
    mask
}

/// Straight-through backward: d_scores = d_mask.
pub fn get_subnet_backward(d_mask: &[f32]) -> Vec<f32> {
    d_mask.to_vec()
}

/// Tensor-level forward. The mask has the shape of `scores`.
pub fn get_subnet(scores: &Tensor, k: RetainFraction) -> Tensor {
    Tensor {
        data: get_subnet_forward(&scores.data, k),
        shape: scores.shape.clone(),
    }
}

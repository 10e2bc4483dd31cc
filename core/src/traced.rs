/// Traced op wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena
///   2. Calls the real tensor/conv/subnet function
///   3. Allocates the output in the arena
///   4. Records the TapeOp
///   5. Returns the output BufId
///
/// Layer `forward_traced` methods are built from these and produce the same
/// values as their untracked `forward` counterparts.

use crate::conv::{self, Conv2dDims};
use crate::params::RetainFraction;
use crate::subnet;
use crate::tape::{BufId, Tape, TapeOp};
use crate::tensor;

/// out = A @ B^T, A: [m, k], B: [n, k].
pub fn traced_matmul_transpose_b(tape: &mut Tape, a: BufId, b: BufId, m: usize, k: usize, n: usize) -> BufId {
    let mut out = vec![0.0f32; m * n];
    tensor::matmul_transpose_b_f32(tape.buf_data(a), tape.buf_data(b), &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| {
        TapeOp::MatmulTransposeB { a, b, out: out_id, m, k, n }
    })
}

/// out[r, c] = A[r, c] + bias[c], A: [rows, cols].
pub fn traced_add_row_bias(tape: &mut Tape, input: BufId, bias: BufId, rows: usize, cols: usize) -> BufId {
    let x = tape.buf_data(input);
    let b = tape.buf_data(bias);
    debug_assert_eq!(x.len(), rows * cols);
    debug_assert_eq!(b.len(), cols);
    let out: Vec<f32> = x.iter().enumerate().map(|(i, v)| v + b[i % cols]).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::AddRowBias { input, bias, out: out_id, rows, cols })
}

/// out = A * B element-wise. Output takes A's shape.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let mut out = vec![0.0f32; tape.buf_numel(a)];
    tensor::mul_f32(tape.buf_data(a), tape.buf_data(b), &mut out);
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Mul { a, b, out: out_id })
}

pub fn traced_abs(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|v| v.abs()).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Abs { input, out: out_id })
}

pub fn traced_relu(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|v| v.max(0.0)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Relu { input, out: out_id })
}

pub fn traced_reshape(tape: &mut Tape, input: BufId, shape: Vec<usize>) -> BufId {
    debug_assert_eq!(shape.iter().product::<usize>(), tape.buf_numel(input));
    let out = tape.buf_data(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Reshape { input, out: out_id })
}

/// Binary top-k mask of `scores`; backward is straight-through.
pub fn traced_get_subnet(tape: &mut Tape, scores: BufId, k: RetainFraction) -> BufId {
    let out = subnet::get_subnet_forward(tape.buf_data(scores), k);
    let shape = tape.buf_shape(scores).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::GetSubnet { input: scores, k, out: out_id })
}

pub fn traced_conv2d(tape: &mut Tape, input: BufId, weight: BufId, bias: Option<BufId>, dims: Conv2dDims) -> BufId {
    let out = conv::conv2d_forward(
        tape.buf_data(input),
        tape.buf_data(weight),
        bias.map(|b| tape.buf_data(b)),
        &dims,
    );
    tape.record_with_output(out, dims.output_shape(), |out_id| {
        TapeOp::Conv2d { input, weight, bias, out: out_id, dims }
    })
}

/// Scalar sum of all elements.
pub fn traced_sum(tape: &mut Tape, input: BufId) -> BufId {
    let s: f32 = tape.buf_data(input).iter().sum();
    tape.record_with_output(vec![s], vec![1], |out_id| TapeOp::Sum { input, out: out_id })
}

/// Scalar mean squared error.
pub fn traced_mse_loss(tape: &mut Tape, pred: BufId, target: BufId) -> BufId {
    let p = tape.buf_data(pred);
    let t = tape.buf_data(target);
    debug_assert_eq!(p.len(), t.len());
    let n = p.len().max(1) as f32;
    let loss = p.iter().zip(t).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / n;
    tape.record_with_output(vec![loss], vec![1], |out_id| TapeOp::MseLoss { pred, target, out: out_id })
}

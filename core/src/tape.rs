// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape,
// then replays them in reverse to compute gradients via the chain rule.
//
// Opt-in: nothing is recorded unless with_tape() is called.
// All intermediates are stored in the arena; backward never recomputes.
// Parameters are snapshotted at registration and are immune to later mutation.
// Frozen buffers never accumulate gradient.

use std::cell::Cell;

use crate::conv::{self, Conv2dDims};
use crate::params::{Frozen, Gradients, ParamId, RetainFraction, Trainable};
use crate::subnet;
use crate::tensor;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// What a buffer is, for the purpose of gradient flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufRole {
    /// Inputs and intermediates. Gradients accumulate but are not exported.
    Activation,
    /// Frozen parameter. Gradient accumulation is refused.
    Frozen,
    /// Trainable parameter. Gradients are exported by `gradients()`.
    Trainable(ParamId),
}

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub role: BufRole,
}

impl TapeBuf {
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B^T where A: [m, k], B: [n, k], out: [m, n]
    MatmulTransposeB { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// NCHW convolution with optional bias.
    Conv2d { input: BufId, weight: BufId, bias: Option<BufId>, out: BufId, dims: Conv2dDims },

    // ── Element-wise ────────────────────────────────────────────
    /// out[r, c] = A[r, c] + bias[c], A: [rows, cols]
    AddRowBias { input: BufId, bias: BufId, out: BufId, rows: usize, cols: usize },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = |A|; d_A = d_out * sign(A), sign(0) = 0
    Abs { input: BufId, out: BufId },
    /// out = max(A, 0)
    Relu { input: BufId, out: BufId },
    /// out = A with a new shape; gradient passes through
    Reshape { input: BufId, out: BufId },

    // ── Masking ─────────────────────────────────────────────────
    /// Top-k binary mask of the input scores, straight-through backward.
    GetSubnet { input: BufId, k: RetainFraction, out: BufId },

    // ── Reductions / losses ─────────────────────────────────────
    /// out = sum(A)  (scalar)
    Sum { input: BufId, out: BufId },
    /// out = mean((pred - target)^2)  (scalar)
    MseLoss { pred: BufId, target: BufId, out: BufId },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD.
///
/// Records operations during forward pass, replays in reverse for gradients.
/// Created via `with_tape()`, dropped after backward pass completes.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. None until backward seeds them.
    grad_accum: Vec<Option<Vec<f32>>>,
    /// Whether we are currently recording (always true between creation and backward).
    recording: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape {
            ops: Vec::new(),
            bufs: Vec::new(),
            grad_accum: Vec::new(),
            recording: true,
        }
    }

    // ── Buffer management ────────────────────────────────────────

    fn push_buf(&mut self, data: Vec<f32>, shape: Vec<usize>, role: BufRole) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let id = self.bufs.len();
        self.bufs.push(TapeBuf { data, shape, role });
        self.grad_accum.push(None);
        id
    }

    /// Allocate a new activation buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        self.push_buf(data, shape, BufRole::Activation)
    }

    /// Register an input (non-parameter) buffer. Clones the data.
    pub fn register_input(&mut self, t: &tensor::Tensor) -> BufId {
        self.alloc(t.data.clone(), t.shape.clone())
    }

    /// Register a trainable parameter. CLONES the data: the tape holds its
    /// own snapshot, immune to later optimizer steps on the original.
    pub fn register_trainable(&mut self, p: &Trainable) -> BufId {
        let t = p.tensor();
        self.push_buf(t.data.clone(), t.shape.clone(), BufRole::Trainable(p.id()))
    }

    /// Register a frozen parameter. No gradient will ever accumulate on it.
    pub fn register_frozen(&mut self, p: &Frozen) -> BufId {
        let t = p.tensor();
        self.push_buf(t.data.clone(), t.shape.clone(), BufRole::Frozen)
    }

    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn role(&self, id: BufId) -> BufRole {
        self.bufs[id].role
    }

    /// Copy a buffer out as a tensor.
    pub fn to_tensor(&self, id: BufId) -> tensor::Tensor {
        tensor::Tensor { data: self.bufs[id].data.clone(), shape: self.bufs[id].shape.clone() }
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Record an operation on the tape. Output buffers must already exist.
    pub fn record(&mut self, op: TapeOp) {
        assert!(self.recording, "Tape::record called but tape is not recording");
        self.ops.push(op);
    }

    /// Record an operation and allocate its output buffer in one step.
    /// Returns the output BufId.
    pub fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                               op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Seed the gradient for a buffer (typically the scalar loss).
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.grad_accum[id] = Some(grad);
    }

    /// Accumulate gradient into a buffer's accumulator. Frozen buffers are skipped.
    fn accumulate_grad(&mut self, id: BufId, grad: &[f32]) {
        if self.bufs[id].role == BufRole::Frozen {
            return;
        }
        let n = self.bufs[id].numel();
        assert_eq!(grad.len(), n, "accumulate_grad size mismatch: grad={} buf={}", grad.len(), n);
        match &mut self.grad_accum[id] {
            Some(existing) => {
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => {
                self.grad_accum[id] = Some(grad.to_vec());
            }
        }
    }

    /// Get the accumulated gradient for a buffer. None if no gradient flowed
    /// to it, and always None for frozen buffers.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grad_accum[id].as_deref()
    }

    /// Gradients of every trainable buffer that received one.
    ///
    /// A parameter registered more than once (e.g. a layer applied twice)
    /// gets the sum of its per-use gradients.
    pub fn gradients(&self) -> Gradients {
        let mut summed: std::collections::HashMap<ParamId, Vec<f32>> = std::collections::HashMap::new();
        for (buf, grad) in self.bufs.iter().zip(&self.grad_accum) {
            let (BufRole::Trainable(pid), Some(grad)) = (buf.role, grad) else { continue };
            match summed.get_mut(&pid) {
                Some(acc) => acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g),
                None => {
                    summed.insert(pid, grad.clone());
                }
            }
        }
        let mut out = Gradients::new();
        for (pid, g) in summed {
            out.insert(pid, g);
        }
        out
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Run the backward pass: replay ops in reverse, computing VJPs.
    /// A scalar loss is auto-seeded with 1.0; otherwise call seed_grad() first.
    pub fn backward(&mut self, loss_id: BufId) {
        self.recording = false;

        if self.grad_accum[loss_id].is_none() {
            assert_eq!(self.bufs[loss_id].numel(), 1,
                       "Auto-seeding only works for scalar loss (got {} elements)",
                       self.bufs[loss_id].numel());
            self.grad_accum[loss_id] = Some(vec![1.0]);
        }

        for op_idx in (0..self.ops.len()).rev() {
            // Clone the op to avoid borrow conflict with self.
            let op = self.ops[op_idx].clone();
            self.backward_op(&op);
        }
    }

    /// Compute VJP for a single operation.
    fn backward_op(&mut self, op: &TapeOp) {
        match op {
            // ── MatmulTransposeB: out = A @ B^T ──────────────────
            TapeOp::MatmulTransposeB { a, b, out, m, k, n } => {
                let (m, k, n) = (*m, *k, *n);
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    // d_A = d_out @ B  (d_out: m×n, B: n×k → d_A: m×k)
                    let mut d_a = vec![0.0f32; m * k];
                    tensor::matmul_f32(&d_out, &self.bufs[*b].data, &mut d_a, m, n, k);
                    self.accumulate_grad(*a, &d_a);

                    // d_B = d_out^T @ A  (d_out^T: n×m, A: m×k → d_B: n×k)
                    let mut d_out_t = vec![0.0f32; n * m];
                    tensor::transpose_f32(&d_out, &mut d_out_t, m, n);
                    let mut d_b = vec![0.0f32; n * k];
                    tensor::matmul_f32(&d_out_t, &self.bufs[*a].data, &mut d_b, n, m, k);
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── Conv2d ───────────────────────────────────────────
            TapeOp::Conv2d { input, weight, bias, out, dims } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let (d_x, d_w, d_b) = conv::conv2d_backward(
                        &d_out, &self.bufs[*input].data, &self.bufs[*weight].data, dims,
                    );
                    self.accumulate_grad(*input, &d_x);
                    self.accumulate_grad(*weight, &d_w);
                    if let Some(bias) = bias {
                        self.accumulate_grad(*bias, &d_b);
                    }
                }
            }

            // ── AddRowBias ───────────────────────────────────────
            TapeOp::AddRowBias { input, bias, out, rows, cols } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let mut d_bias = vec![0.0f32; *cols];
                    for r in 0..*rows {
                        for c in 0..*cols {
                            d_bias[c] += d_out[r * cols + c];
                        }
                    }
                    self.accumulate_grad(*input, &d_out);
                    self.accumulate_grad(*bias, &d_bias);
                }
            }

            // ── Mul: out = A * B ─────────────────────────────────
            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    // d_A = d_out * B
                    let d_a: Vec<f32> = d_out.iter().zip(self.bufs[*b].data.iter())
                        .map(|(d, b)| d * b).collect();
                    self.accumulate_grad(*a, &d_a);
                    // d_B = d_out * A
                    let d_b: Vec<f32> = d_out.iter().zip(self.bufs[*a].data.iter())
                        .map(|(d, a)| d * a).collect();
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── Abs ──────────────────────────────────────────────
            TapeOp::Abs { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_input: Vec<f32> = d_out.iter().zip(self.bufs[*input].data.iter())
                        .map(|(d, x)| if *x > 0.0 { *d } else if *x < 0.0 { -d } else { 0.0 })
                        .collect();
                    self.accumulate_grad(*input, &d_input);
                }
            }

            // ── Relu ─────────────────────────────────────────────
            TapeOp::Relu { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_input: Vec<f32> = d_out.iter().zip(self.bufs[*input].data.iter())
                        .map(|(d, x)| if *x > 0.0 { *d } else { 0.0 })
                        .collect();
                    self.accumulate_grad(*input, &d_input);
                }
            }

            // ── Reshape ──────────────────────────────────────────
            TapeOp::Reshape { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad(*input, &d_out);
                }
            }

            // ── GetSubnet: straight-through ──────────────────────
            TapeOp::GetSubnet { input, k: _, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_input = subnet::get_subnet_backward(&d_out);
                    self.accumulate_grad(*input, &d_input);
                }
            }

            // ── Sum ──────────────────────────────────────────────
            TapeOp::Sum { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_input = vec![d_out[0]; self.bufs[*input].numel()];
                    self.accumulate_grad(*input, &d_input);
                }
            }

            // ── MseLoss ──────────────────────────────────────────
            TapeOp::MseLoss { pred, target, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let n = self.bufs[*pred].numel().max(1) as f32;
                    let scale = 2.0 * d_out[0] / n;
                    let d_pred: Vec<f32> = self.bufs[*pred].data.iter()
                        .zip(self.bufs[*target].data.iter())
                        .map(|(p, t)| scale * (p - t)).collect();
                    let d_target: Vec<f32> = d_pred.iter().map(|g| -g).collect();
                    self.accumulate_grad(*pred, &d_pred);
                    self.accumulate_grad(*target, &d_target);
                }
            }
        }
    }
}

// ── Thread-local tape access (opt-in) ────────────────────────────────

thread_local! {
    static TAPE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Drop guard that clears the TAPE_ACTIVE flag when scope exits, including
/// on panic. Ensures `is_tape_active()` is never left stale.
struct TapeGuard;

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_ACTIVE.with(|flag| flag.set(false));
    }
}

/// Execute a closure with an active tape. Sets the thread-local active flag
/// for the duration of `f`; it is cleared via a drop guard when `f` returns
/// or panics. This is the sole entry point for AD: outside it, layer
/// forwards record nothing.
pub fn with_tape<F, R>(f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    TAPE_ACTIVE.with(|flag| {
        debug_assert!(!flag.get(), "nested with_tape() calls are not supported");
        flag.set(true);
    });

    let _guard = TapeGuard;
    let mut tape = Tape::new();
    f(&mut tape)
}

/// True only while inside a `with_tape()` closure on this thread.
pub fn is_tape_active() -> bool {
    TAPE_ACTIVE.with(|flag| flag.get())
}

// ── Tests ────────────────────────────────────────────────────────────

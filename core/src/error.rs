/// Error types for subnet construction, forward passes and checkpoints.
///
/// Every failure here is a configuration or programming defect. Nothing is
/// retried; errors surface to the caller as soon as they are detected.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubnetError {
    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Data length does not match the product of the declared shape.
    #[error("tensor data has {len} elements but shape {shape:?} needs {expected}")]
    DataLength {
        len: usize,
        shape: Vec<usize>,
        expected: usize,
    },

    /// A shape that the operation cannot work with (e.g. fan of a 1-D tensor).
    #[error("invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    /// Retain fraction outside (0, 1].
    #[error("retain fraction {0} is outside (0, 1]")]
    InvalidRetainFraction(f64),

    /// Convolution geometry that cannot be realized (groups, zero stride, ...).
    #[error("invalid convolution configuration: {0}")]
    InvalidConv(String),

    /// Initializer parameters whose Uniform(-b, b) range is not finite in f32.
    #[error("initializer bound {0} does not give a finite f32 range")]
    InitBound(f64),

    /// A named tensor expected in a state dict is absent.
    #[error("state dict is missing tensor {0:?}")]
    MissingTensor(String),

    #[error("checkpoint I/O failed: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SubnetError>;

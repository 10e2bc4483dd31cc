//! Edge-popup supermask layers.
//!
//! Layers keep their weights frozen at initialization and learn only a
//! per-weight score. Each forward keeps the top-k fraction of weights by
//! |score| and zeroes the rest; the mask's gradient passes straight through
//! to the scores.

pub mod error;
pub mod tensor;
pub mod params;
pub mod init;
pub mod subnet;
pub mod conv;
pub mod tape;
pub mod traced;
pub mod config;
pub mod checkpoint;
pub mod linear;
pub mod conv2d;
pub mod model;
pub mod adapt;
pub mod optim;

pub use adapt::{adapt_model, SubnetMapping};
pub use checkpoint::{load_checkpoint, save_checkpoint, StateDict};
pub use config::SubnetConfig;
pub use conv::Conv2dGeometry;
pub use conv2d::{Conv2dSubnet, DenseConv2d};
pub use error::{Result, SubnetError};
pub use init::{FanMode, Initializer, Nonlinearity, SparsityScaledUniform};
pub use linear::{DenseLinear, LinearConfig, LinearSubnet};
pub use model::{Layer, Sequential};
pub use optim::{AdamW, AdamWConfig, Optimizer, Sgd, SgdConfig};
pub use params::{Frozen, Gradients, ParamId, RetainFraction, Trainable};
pub use subnet::get_subnet;
pub use tape::{is_tape_active, with_tape, Tape};
pub use tensor::Tensor;

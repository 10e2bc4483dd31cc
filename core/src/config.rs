/// Subnet construction settings shared by the masked layers and model surgery.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::init::SparsityScaledUniform;
use crate::params::RetainFraction;

/// Default retain fraction when none is given.
pub const DEFAULT_K: f64 = 0.3;

fn default_k() -> RetainFraction {
    RetainFraction::DEFAULT
}

/// Extra constructor arguments a masked layer takes on top of the dense
/// layer's own attributes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Fraction of weight positions kept active.
    #[serde(default = "default_k")]
    pub k: RetainFraction,
    #[serde(default)]
    pub init: SparsityScaledUniform,
    /// RNG seed for weight, bias and score init. None draws from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        SubnetConfig {
            k: default_k(),
            init: SparsityScaledUniform::default(),
            seed: None,
        }
    }
}

impl SubnetConfig {
    pub fn with_k(k: f64) -> Result<Self> {
        Ok(SubnetConfig { k: RetainFraction::new(k)?, ..SubnetConfig::default() })
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Model surgery: swap dense layers for their subnet counterparts.
///
/// The walk is depth first over `Sequential` children. A replaced layer
/// keeps the dense layer's constructor attributes (features or channels,
/// kernel, stride, padding, dilation, groups, bias flag) and takes the
/// mapping's retain fraction and initializer. Dense weights are dropped and
/// re-drawn by the subnet layer's own initializer.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SubnetConfig;
use crate::conv2d::Conv2dSubnet;
use crate::error::Result;
use crate::init;
use crate::linear::LinearSubnet;
use crate::model::Layer;

/// Which dense layer kinds to replace, plus the extra subnet arguments.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubnetMapping {
    #[serde(default = "yes")]
    pub linear: bool,
    #[serde(default = "yes")]
    pub conv2d: bool,
    #[serde(default)]
    pub subnet: SubnetConfig,
}

fn yes() -> bool {
    true
}

impl Default for SubnetMapping {
    fn default() -> Self {
        SubnetMapping { linear: true, conv2d: true, subnet: SubnetConfig::default() }
    }
}

impl SubnetMapping {
    pub fn new(subnet: SubnetConfig) -> Self {
        SubnetMapping { subnet, ..SubnetMapping::default() }
    }

    pub fn linear_only(subnet: SubnetConfig) -> Self {
        SubnetMapping { linear: true, conv2d: false, subnet }
    }

    pub fn conv2d_only(subnet: SubnetConfig) -> Self {
        SubnetMapping { linear: false, conv2d: true, subnet }
    }
}

/// Replace matching dense layers in `root` (root included) and return how
/// many were replaced. A single RNG seeded from the mapping drives every
/// new layer in walk order, so a seeded surgery is reproducible.
///
/// On error the tree is left with the replacements made so far.
pub fn adapt_model(root: &mut Layer, mapping: &SubnetMapping) -> Result<usize> {
    let mut rng = init::make_rng(mapping.subnet.seed);
    let replaced = visit(root, "", mapping, &mut rng)?;
    info!(replaced, k = mapping.subnet.k.get(), "model surgery complete");
    Ok(replaced)
}

fn visit(layer: &mut Layer, path: &str, mapping: &SubnetMapping, rng: &mut StdRng) -> Result<usize> {
    let k = mapping.subnet.k;
    let init = &mapping.subnet.init;
    let replacement = match layer {
        Layer::Linear(dense) if mapping.linear => {
            Layer::LinearSubnet(LinearSubnet::with_initializer(*dense.config(), k, init, rng)?)
        }
        Layer::Conv2d(dense) if mapping.conv2d => {
            Layer::Conv2dSubnet(Conv2dSubnet::with_initializer(*dense.geometry(), dense.has_bias(), k, init, rng)?)
        }
        Layer::Sequential(seq) => {
            let mut count = 0;
            for (name, child) in seq.children_mut() {
                let child_path = if path.is_empty() { name.to_string() } else { format!("{path}.{name}") };
                count += visit(child, &child_path, mapping, rng)?;
            }
            return Ok(count);
        }
        other => {
            debug!(path, kind = other.kind(), "left unchanged");
            return Ok(0);
        }
    };
    info!(path, from = layer.kind(), to = replacement.kind(), "replaced layer");
    *layer = replacement;
    Ok(1)
}

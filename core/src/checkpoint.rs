/// Named parameter enumeration and JSON checkpoints.
///
/// A `StateDict` lists every tensor a layer owns by dotted name, frozen
/// tensors included, so that a save/load round trip restores the frozen
/// weight and bias along with the trainable scores.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SubnetError};
use crate::params::{Frozen, Trainable};
use crate::tensor::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Frozen,
    Trainable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub role: TensorRole,
    pub tensor: Tensor,
}

/// Ordered map from dotted parameter name to tensor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    entries: BTreeMap<String, TensorRecord>,
}

impl StateDict {
    pub fn new() -> Self {
        StateDict::default()
    }

    pub fn insert_frozen(&mut self, name: impl Into<String>, p: &Frozen) {
        self.entries.insert(name.into(), TensorRecord { role: TensorRole::Frozen, tensor: p.tensor().clone() });
    }

    pub fn insert_trainable(&mut self, name: impl Into<String>, p: &Trainable) {
        self.entries.insert(name.into(), TensorRecord { role: TensorRole::Trainable, tensor: p.tensor().clone() });
    }

    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.entries.get(name)
    }

    /// Clone out the tensor stored under `name`.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        self.entries
            .get(name)
            .map(|r| r.tensor.clone())
            .ok_or_else(|| SubnetError::MissingTensor(name.to_string()))
    }

    /// Merge `child` under `prefix.`.
    pub fn extend_prefixed(&mut self, prefix: &str, child: StateDict) {
        for (name, rec) in child.entries {
            self.entries.insert(format!("{prefix}.{name}"), rec);
        }
    }

    /// Entries below `prefix.`, with the prefix stripped.
    pub fn scoped(&self, prefix: &str) -> StateDict {
        let lead = format!("{prefix}.");
        let entries = self
            .entries
            .iter()
            .filter_map(|(name, rec)| name.strip_prefix(&lead).map(|rest| (rest.to_string(), rec.clone())))
            .collect();
        StateDict { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total element count over all tensors with the given role.
    pub fn numel_with_role(&self, role: TensorRole) -> usize {
        self.entries.values().filter(|r| r.role == role).map(|r| r.tensor.numel()).sum()
    }
}

// ── Checkpoint Serialization ─────────────────────────────────────────

const CHECKPOINT_FORMAT: u32 = 1;

/// Internal wrapper for JSON checkpoint format.
#[derive(Serialize, Deserialize)]
struct SubnetCheckpoint {
    format: u32,
    tensors: StateDict,
}

/// Save a state dict to a JSON file.
pub fn save_checkpoint(path: &Path, state: &StateDict) -> Result<()> {
    let checkpoint = SubnetCheckpoint { format: CHECKPOINT_FORMAT, tensors: state.clone() };
    let json = serde_json::to_string(&checkpoint)?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), tensors = state.len(), "saved checkpoint");
    Ok(())
}

/// Load a state dict from a JSON file.
pub fn load_checkpoint(path: &Path) -> Result<StateDict> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: SubnetCheckpoint = serde_json::from_str(&json)?;
    debug!(path = %path.display(), format = checkpoint.format, tensors = checkpoint.tensors.len(), "loaded checkpoint");
    Ok(checkpoint.tensors)
}

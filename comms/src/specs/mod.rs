pub mod codec;

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// The storage precision of a tensor, both in the trainer and on the rollout side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl DType {
    /// The amount of bytes a single element takes.
    pub fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::Bf16 => 2,
        }
    }
}

/// Describes a named tensor travelling through the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorSpec {
    /// The amount of elements in the tensor.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The amount of bytes the encoded tensor takes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }
}

/// The serving layout of a rollout engine.
///
/// Tensors pushed to an engine are split along their leading dimension
/// into `tp_size` parts, the engine keeps part `tp_rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub tp_rank: usize,
    pub tp_size: NonZeroUsize,
    pub dtype: DType,
}

impl Default for EngineSpec {
    fn default() -> Self {
        Self {
            tp_rank: 0,
            tp_size: NonZeroUsize::MIN,
            dtype: DType::F32,
        }
    }
}

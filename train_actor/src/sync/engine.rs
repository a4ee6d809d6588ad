use std::{io, sync::Arc};

use async_trait::async_trait;
use comms::specs::{EngineSpec, TensorSpec};

/// Position of a rollout engine in the connected list.
pub type EngineId = usize;

/// Monotonic label of a committed weight push.
pub type WeightVersion = u64;

/// Serializes weight pushes against inference requests on the rollout side.
pub type EngineLock = Arc<tokio::sync::Mutex<()>>;

pub type EngineHandle = Arc<dyn RolloutEngine>;

/// An encoded tensor, ready to be staged into a rollout engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTensor {
    pub spec: TensorSpec,
    pub bytes: Vec<u8>,
}

/// A process serving inference for rollout generation.
///
/// Engines take new weights in two phases: tensors are staged under a
/// version, the engine acknowledges the complete version through `ready`,
/// then `commit` swaps them in atomically. Staged weights are never served.
#[async_trait]
pub trait RolloutEngine: Send + Sync {
    fn id(&self) -> EngineId;

    /// The layout the engine expects its tensors in.
    fn spec(&self) -> EngineSpec;

    /// Stages a bucket of tensors under `version`.
    ///
    /// Staging a new version discards whatever was staged before.
    async fn stage(&self, version: WeightVersion, bucket: Vec<WireTensor>) -> io::Result<()>;

    /// Asks the engine to confirm it holds the complete `version`.
    ///
    /// # Returns
    /// The version the engine acknowledges.
    async fn ready(&self, version: WeightVersion) -> io::Result<WeightVersion>;

    /// Makes `version` the weights served from now on.
    async fn commit(&self, version: WeightVersion) -> io::Result<()>;

    /// Discards the staged `version`, the served weights are left untouched.
    async fn abort(&self, version: WeightVersion) -> io::Result<()>;
}

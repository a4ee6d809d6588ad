mod broadcast;
mod direct;
mod engine;
mod local;
mod push;
mod registry;
mod remote;
pub mod reshard;
mod synchronizer;
mod updater;

pub use broadcast::DistributedBroadcast;
pub use direct::DirectTransfer;
pub use engine::{EngineHandle, EngineId, EngineLock, RolloutEngine, WeightVersion, WireTensor};
pub use local::{EngineWeights, LocalRolloutEngine};
pub use remote::{RemoteRolloutEngine, serve_engine};
pub use synchronizer::{WeightSynchronizer, WeightSynchronizerTemplate};
pub use updater::WeightUpdater;

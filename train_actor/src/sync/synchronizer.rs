use std::collections::BTreeMap;

use super::{EngineHandle, EngineId, EngineLock, WeightVersion};
use crate::{error::Result, params::ParameterStore};

/// A `WeightSynchronizer` publishes the actor's weights to the connected rollout engines.
#[allow(unused)]
#[trait_variant::make(WeightSynchronizer: Send)]
pub trait WeightSynchronizerTemplate {
    /// Registers the rollout engines to push to and the lock serializing them.
    ///
    /// # Arguments
    /// * `engines` - The engines, each identified by its position.
    /// * `lock` - Held by the rollout side while serving, held here while pushing.
    ///
    /// # Returns
    /// `AlreadyConnected` if engines were registered before.
    fn connect_rollout_engines(&self, engines: Vec<EngineHandle>, lock: EngineLock) -> Result<()>;

    /// Forgets the registered engines.
    fn disconnect_rollout_engines(&self) -> Option<Vec<EngineHandle>>;

    /// Publishes the actor as a new weight version.
    ///
    /// Either every engine commits the new version or none does. Pushes never
    /// overlap, a second call waits for the first to finish.
    ///
    /// # Arguments
    /// * `store` - The parameter store, read from its host snapshot when offloaded.
    ///
    /// # Returns
    /// The committed version or `PartialSync` naming the engines that failed.
    async fn update_weights(&self, store: &ParameterStore) -> Result<WeightVersion>;

    /// The version each engine last committed.
    async fn acked_versions(&self) -> BTreeMap<EngineId, WeightVersion>;
}

use std::{collections::BTreeMap, time::Duration};

use super::{
    DirectTransfer, DistributedBroadcast, EngineHandle, EngineId, EngineLock, WeightSynchronizer,
    WeightVersion,
};
use crate::{collective::ProcessGroup, error::Result, params::ParameterStore};

/// The synchronization strategy selected by the actor's deployment.
pub enum WeightUpdater {
    Direct(DirectTransfer),
    Broadcast(DistributedBroadcast),
}

impl WeightUpdater {
    /// Selects direct transfer for colocated engines and broadcast otherwise.
    ///
    /// # Arguments
    /// * `colocate` - Whether engines share devices with the trainer.
    /// * `group` - This rank's process group.
    /// * `bucket_bytes` - The maximum amount of bytes per transfer bucket.
    /// * `timeout` - How long an engine may take for each push phase.
    ///
    /// # Returns
    /// The selected strategy.
    pub fn new(colocate: bool, group: ProcessGroup, bucket_bytes: usize, timeout: Duration) -> Self {
        if colocate {
            Self::Direct(DirectTransfer::new(bucket_bytes, timeout))
        } else {
            Self::Broadcast(DistributedBroadcast::new(group, bucket_bytes, timeout))
        }
    }
}

impl WeightSynchronizer for WeightUpdater {
    fn connect_rollout_engines(&self, engines: Vec<EngineHandle>, lock: EngineLock) -> Result<()> {
        match self {
            Self::Direct(s) => s.connect_rollout_engines(engines, lock),
            Self::Broadcast(s) => s.connect_rollout_engines(engines, lock),
        }
    }

    fn disconnect_rollout_engines(&self) -> Option<Vec<EngineHandle>> {
        match self {
            Self::Direct(s) => s.disconnect_rollout_engines(),
            Self::Broadcast(s) => s.disconnect_rollout_engines(),
        }
    }

    async fn update_weights(&self, store: &ParameterStore) -> Result<WeightVersion> {
        match self {
            Self::Direct(s) => s.update_weights(store).await,
            Self::Broadcast(s) => s.update_weights(store).await,
        }
    }

    async fn acked_versions(&self) -> BTreeMap<EngineId, WeightVersion> {
        match self {
            Self::Direct(s) => s.acked_versions().await,
            Self::Broadcast(s) => s.acked_versions().await,
        }
    }
}

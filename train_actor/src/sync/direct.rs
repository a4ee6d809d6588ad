use std::{collections::BTreeMap, time::Duration};

use log::info;

use super::{
    EngineHandle, EngineId, EngineLock, WeightSynchronizer, WeightVersion, push,
    registry::EngineRegistry, reshard,
};
use crate::{
    error::{ActorErr, Result},
    params::ParameterStore,
};

/// Pushes weights straight to colocated engines.
///
/// Each engine receives its own tensor-parallel slice encoded in its own
/// precision, and the engine lock is held for the whole push.
pub struct DirectTransfer {
    registry: EngineRegistry,
    bucket_bytes: usize,
    timeout: Duration,
}

impl DirectTransfer {
    /// Creates a new `DirectTransfer` synchronizer.
    ///
    /// # Arguments
    /// * `bucket_bytes` - The maximum amount of bytes per transfer bucket.
    /// * `timeout` - How long an engine may take for each push phase.
    ///
    /// # Returns
    /// A new disconnected `DirectTransfer`.
    pub fn new(bucket_bytes: usize, timeout: Duration) -> Self {
        Self {
            registry: EngineRegistry::default(),
            bucket_bytes,
            timeout,
        }
    }
}

impl WeightSynchronizer for DirectTransfer {
    fn connect_rollout_engines(&self, engines: Vec<EngineHandle>, lock: EngineLock) -> Result<()> {
        self.registry.connect(engines, lock)
    }

    fn disconnect_rollout_engines(&self) -> Option<Vec<EngineHandle>> {
        self.registry.disconnect()
    }

    async fn update_weights(&self, store: &ParameterStore) -> Result<WeightVersion> {
        let conn = self.registry.connection()?;
        let actor = store.actor_weights()?;

        let mut book = self.registry.book.lock().await;
        let _serving = conn.lock.lock().await;
        let version = book.next_version();

        info!(
            "pushing weights at step {} as version {version} to {} engines",
            actor.version(),
            conn.engines.len()
        );

        push::push_all(&conn.engines, version, self.timeout, |spec| {
            reshard::for_engine(actor, spec, self.bucket_bytes)
        })
        .await
        .map_err(|unreachable| ActorErr::PartialSync {
            version,
            unreachable,
        })?;

        book.commit(&conn.engines, version);
        Ok(version)
    }

    async fn acked_versions(&self) -> BTreeMap<EngineId, WeightVersion> {
        self.registry.book.lock().await.acked.clone()
    }
}

use std::{collections::BTreeMap, time::Duration};

use log::{debug, info};

use super::{
    EngineHandle, EngineId, EngineLock, WeightSynchronizer, WeightVersion, push,
    registry::{Connection, EngineRegistry},
    reshard,
};
use crate::{
    collective::ProcessGroup,
    error::{ActorErr, Result},
    params::ParameterStore,
};

/// Broadcasts weights from the root rank to engines on separate devices.
///
/// Every rank enters the push, only the root sends, and full precision
/// tensors travel in buckets so the engines reshard on their side.
pub struct DistributedBroadcast {
    registry: EngineRegistry,
    group: ProcessGroup,
    bucket_bytes: usize,
    timeout: Duration,
}

impl DistributedBroadcast {
    /// Creates a new `DistributedBroadcast` synchronizer.
    ///
    /// # Arguments
    /// * `group` - This rank's process group.
    /// * `bucket_bytes` - The maximum amount of bytes per broadcast bucket.
    /// * `timeout` - How long an engine may take for each push phase.
    ///
    /// # Returns
    /// A new disconnected `DistributedBroadcast`.
    pub fn new(group: ProcessGroup, bucket_bytes: usize, timeout: Duration) -> Self {
        Self {
            registry: EngineRegistry::default(),
            group,
            bucket_bytes,
            timeout,
        }
    }

    async fn broadcast(
        &self,
        conn: &Connection,
        store: &ParameterStore,
        version: WeightVersion,
    ) -> Result<()> {
        let actor = store.actor_weights()?;
        let _serving = conn.lock.lock().await;

        let buckets = reshard::bucket(
            actor.iter().map(|(desc, values)| reshard::full(desc, values)),
            self.bucket_bytes,
        );

        info!(
            "broadcasting weights at step {} as version {version} in {} buckets",
            actor.version(),
            buckets.len()
        );

        push::push_all(&conn.engines, version, self.timeout, |_| buckets.clone())
            .await
            .map_err(|unreachable| ActorErr::PartialSync {
                version,
                unreachable,
            })
    }
}

/// Marks the engines the root failed to reach, the last slot flags a failure
/// that happened before any engine was contacted.
fn failure_flags(engines: &[EngineHandle], res: &Result<()>) -> Vec<f32> {
    let mut flags = vec![0.; engines.len() + 1];
    match res {
        Ok(()) => {}
        Err(ActorErr::PartialSync { unreachable, .. }) => {
            for (flag, engine) in flags.iter_mut().zip(engines) {
                if unreachable.contains(&engine.id()) {
                    *flag = 1.;
                }
            }
        }
        Err(_) => flags[engines.len()] = 1.,
    }
    flags
}

/// The engines the reduced `flags` name, every engine if the push never started.
fn unreachable_engines(engines: &[EngineHandle], flags: &[f32]) -> Vec<EngineId> {
    if flags.last().is_some_and(|&f| f > 0.) {
        return engines.iter().map(|e| e.id()).collect();
    }

    engines
        .iter()
        .zip(flags)
        .filter(|&(_, &flag)| flag > 0.)
        .map(|(e, _)| e.id())
        .collect()
}

impl WeightSynchronizer for DistributedBroadcast {
    fn connect_rollout_engines(&self, engines: Vec<EngineHandle>, lock: EngineLock) -> Result<()> {
        self.registry.connect(engines, lock)
    }

    fn disconnect_rollout_engines(&self) -> Option<Vec<EngineHandle>> {
        self.registry.disconnect()
    }

    async fn update_weights(&self, store: &ParameterStore) -> Result<WeightVersion> {
        let conn = self.registry.connection()?;

        let mut book = self.registry.book.lock().await;
        let version = book.next_version();

        self.group.barrier("update_weights").await?;
        let res = match self.group.is_root() {
            true => self.broadcast(&conn, store, version).await,
            false => Ok(()),
        };

        // every rank learns which engines the root's push missed
        let mut flags = failure_flags(&conn.engines, &res);
        self.group.all_reduce_sum(&mut flags).await?;
        res?;

        let unreachable = unreachable_engines(&conn.engines, &flags);
        if !unreachable.is_empty() {
            return Err(ActorErr::PartialSync {
                version,
                unreachable,
            });
        }

        if self.group.is_root() {
            book.commit(&conn.engines, version);
        }

        debug!("rank {} done with version {version}", self.group.rank());
        Ok(version)
    }

    async fn acked_versions(&self) -> BTreeMap<EngineId, WeightVersion> {
        self.registry.book.lock().await.acked.clone()
    }
}

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;

use crate::{
    RolloutId,
    error::{ActorErr, Result},
    rollout::{DataRef, RolloutBatch},
};

/// Where the actor fetches the rollout results to train on.
#[async_trait]
pub trait RolloutDataGateway: Send + Sync {
    /// Fetches the batch behind `data_ref`.
    ///
    /// # Arguments
    /// * `rollout_id` - The rollout the batch belongs to.
    /// * `data_ref` - The handle the rollout side produced.
    ///
    /// # Returns
    /// The batch or a `Gateway` error.
    async fn fetch(&self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<RolloutBatch>;

    /// Tells the gateway which training run it serves, for metrics correlation.
    fn update_run_id(&self, _run_id: &str) {}
}

/// Reads batches from JSON files, `data_ref` names a file under `root`.
#[derive(Debug, Clone)]
pub struct DirGateway {
    root: PathBuf,
}

impl DirGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RolloutDataGateway for DirGateway {
    async fn fetch(&self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<RolloutBatch> {
        let path = self.root.join(&data_ref.0);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ActorErr::Gateway(format!("reading {}: {e}", path.display())))?;

        let batch: RolloutBatch = serde_json::from_slice(&bytes)
            .map_err(|e| ActorErr::Gateway(format!("parsing {}: {e}", path.display())))?;

        debug!(
            "fetched {} samples and {} episodes for rollout {rollout_id}",
            batch.len(),
            batch.episodes.len()
        );
        Ok(batch)
    }
}

/// Serves batches registered in memory.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    batches: Mutex<HashMap<DataRef, RolloutBatch>>,
    run_id: Mutex<Option<String>>,
}

impl MemoryGateway {
    pub fn insert(&self, data_ref: impl Into<DataRef>, batch: RolloutBatch) {
        self.batches.lock().insert(data_ref.into(), batch);
    }

    /// The run id the actor announced, if any.
    pub fn run_id(&self) -> Option<String> {
        self.run_id.lock().clone()
    }
}

#[async_trait]
impl RolloutDataGateway for MemoryGateway {
    async fn fetch(&self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<RolloutBatch> {
        self.batches.lock().get(data_ref).cloned().ok_or_else(|| {
            ActorErr::Gateway(format!("no batch {:?} for rollout {rollout_id}", data_ref.0))
        })
    }

    fn update_run_id(&self, run_id: &str) {
        *self.run_id.lock() = Some(run_id.to_string());
    }
}

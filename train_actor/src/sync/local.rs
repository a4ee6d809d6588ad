use std::{collections::BTreeMap, io, sync::Arc};

use async_trait::async_trait;
use comms::specs::{EngineSpec, codec};
use log::debug;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use super::{EngineId, RolloutEngine, WeightVersion, WireTensor};

/// The weights an engine serves inference requests with.
#[derive(Debug, Default)]
pub struct EngineWeights {
    pub version: WeightVersion,
    pub tensors: BTreeMap<String, WireTensor>,
}

impl EngineWeights {
    /// Decodes the tensor called `name` back into `f32` values.
    pub fn values(&self, name: &str) -> Option<io::Result<Vec<f32>>> {
        self.tensors
            .get(name)
            .map(|t| codec::decode(&t.bytes, t.spec.dtype))
    }
}

#[derive(Debug)]
struct Staged {
    version: WeightVersion,
    tensors: BTreeMap<String, WireTensor>,
}

/// An in-process rollout engine.
///
/// Committed weights are swapped behind an `Arc` so readers holding the
/// previous version keep a consistent view until they drop it.
#[derive(Debug)]
pub struct LocalRolloutEngine {
    id: EngineId,
    spec: EngineSpec,
    current: RwLock<Arc<EngineWeights>>,
    staged: Mutex<Option<Staged>>,
}

impl LocalRolloutEngine {
    /// Creates a new `LocalRolloutEngine` without any weights.
    ///
    /// # Arguments
    /// * `id` - The engine's position in the connected list.
    /// * `spec` - The layout the engine serves tensors in.
    ///
    /// # Returns
    /// A new `LocalRolloutEngine` instance at version 0.
    pub fn new(id: EngineId, spec: EngineSpec) -> Self {
        Self {
            id,
            spec,
            current: RwLock::new(Arc::default()),
            staged: Mutex::new(None),
        }
    }

    /// The weights currently served.
    pub async fn weights(&self) -> Arc<EngineWeights> {
        Arc::clone(&*self.current.read().await)
    }

    /// The version of the weights currently served.
    pub async fn version(&self) -> WeightVersion {
        self.current.read().await.version
    }
}

#[async_trait]
impl RolloutEngine for LocalRolloutEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn spec(&self) -> EngineSpec {
        self.spec
    }

    async fn stage(&self, version: WeightVersion, bucket: Vec<WireTensor>) -> io::Result<()> {
        let mut staged = self.staged.lock();
        if staged.as_ref().is_some_and(|s| s.version != version) {
            *staged = None;
        }

        let staged = staged.get_or_insert_with(|| Staged {
            version,
            tensors: BTreeMap::new(),
        });

        for tensor in bucket {
            if tensor.bytes.len() != tensor.spec.nbytes() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "tensor {} has {} bytes, expected {}",
                        tensor.spec.name,
                        tensor.bytes.len(),
                        tensor.spec.nbytes()
                    ),
                ));
            }

            staged.tensors.insert(tensor.spec.name.clone(), tensor);
        }

        Ok(())
    }

    async fn ready(&self, version: WeightVersion) -> io::Result<WeightVersion> {
        let current = self.weights().await;
        let staged = self.staged.lock();

        let Some(staged) = staged.as_ref().filter(|s| s.version == version) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("nothing staged for version {version}"),
            ));
        };

        if let Some(missing) = current
            .tensors
            .keys()
            .find(|name| !staged.tensors.contains_key(*name))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("version {version} is missing tensor {missing}"),
            ));
        }

        Ok(version)
    }

    async fn commit(&self, version: WeightVersion) -> io::Result<()> {
        let staged = {
            let mut staged = self.staged.lock();
            match staged.take() {
                Some(s) if s.version == version => s,
                other => {
                    *staged = other;
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("nothing staged for version {version}"),
                    ));
                }
            }
        };

        let weights = Arc::new(EngineWeights {
            version,
            tensors: staged.tensors,
        });

        *self.current.write().await = weights;
        debug!("engine {} committed version {version}", self.id);
        Ok(())
    }

    async fn abort(&self, version: WeightVersion) -> io::Result<()> {
        let mut staged = self.staged.lock();
        if staged.as_ref().is_some_and(|s| s.version == version) {
            *staged = None;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::{DType, TensorSpec};

    use super::*;

    fn tensor(name: &str, values: &[f32]) -> WireTensor {
        WireTensor {
            spec: TensorSpec {
                name: name.to_string(),
                shape: vec![values.len()],
                dtype: DType::F32,
            },
            bytes: codec::encode(values, DType::F32),
        }
    }

    #[tokio::test]
    async fn staged_weights_are_not_served_until_commit() {
        let engine = LocalRolloutEngine::new(0, EngineSpec::default());

        engine.stage(1, vec![tensor("w", &[1., 2.])]).await.unwrap();
        assert_eq!(engine.version().await, 0);
        assert!(engine.weights().await.tensors.is_empty());

        assert_eq!(engine.ready(1).await.unwrap(), 1);
        engine.commit(1).await.unwrap();

        let weights = engine.weights().await;
        assert_eq!(weights.version, 1);
        assert_eq!(weights.values("w").unwrap().unwrap(), vec![1., 2.]);
    }

    #[tokio::test]
    async fn abort_keeps_served_version() {
        let engine = LocalRolloutEngine::new(0, EngineSpec::default());
        engine.stage(1, vec![tensor("w", &[1.])]).await.unwrap();
        engine.commit(1).await.unwrap();

        engine.stage(2, vec![tensor("w", &[5.])]).await.unwrap();
        engine.abort(2).await.unwrap();

        assert!(engine.commit(2).await.is_err());
        assert_eq!(engine.weights().await.values("w").unwrap().unwrap(), vec![1.]);
    }

    #[tokio::test]
    async fn incomplete_version_is_not_ready() {
        let engine = LocalRolloutEngine::new(0, EngineSpec::default());
        engine
            .stage(1, vec![tensor("a", &[1.]), tensor("b", &[2.])])
            .await
            .unwrap();
        engine.commit(1).await.unwrap();

        engine.stage(2, vec![tensor("a", &[3.])]).await.unwrap();
        assert!(engine.ready(2).await.is_err());
    }

    #[tokio::test]
    async fn rejects_misshaped_tensor() {
        let engine = LocalRolloutEngine::new(0, EngineSpec::default());
        let mut bad = tensor("w", &[1., 2.]);
        bad.bytes.pop();
        assert!(engine.stage(1, vec![bad]).await.is_err());
    }
}

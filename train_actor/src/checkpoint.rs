use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{
    error::{ActorErr, Result},
    params::{Location, ParameterSet, Schema},
    training::optimization::ModelOptimizerState,
};

const TRACKER_FILE: &str = "latest_checkpointed_iteration.txt";
const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.json";

/// A checkpoint read back from storage.
#[derive(Debug)]
pub struct Checkpoint {
    /// The iteration it was saved at, `None` for a bare model.
    pub iteration: Option<u64>,
    pub params: ParameterSet,
    pub optimizer: Option<ModelOptimizerState>,
}

/// Persistent storage of model weights and optimizer state.
pub trait CheckpointStore: Send + Sync {
    /// The last iteration fully written under `path`, if any.
    fn latest_iteration(&self, path: &Path) -> Result<Option<u64>>;

    /// Whether anything under `path` claims to be a checkpoint, readable or not.
    fn has_checkpoint(&self, path: &Path) -> Result<bool> {
        Ok(self.latest_iteration(path)?.is_some())
    }

    /// Loads the latest checkpoint under `path`.
    ///
    /// # Arguments
    /// * `path` - The checkpoint root.
    /// * `schema` - The schema the stored weights must follow.
    ///
    /// # Returns
    /// The checkpoint or `CheckpointIo` if it's missing or unreadable.
    fn load(&self, path: &Path, schema: &Arc<Schema>) -> Result<Checkpoint>;

    /// Writes a checkpoint for `iteration` under `path`.
    ///
    /// The checkpoint only becomes the latest once completely written.
    fn save(
        &self,
        path: &Path,
        iteration: u64,
        params: &ParameterSet,
        optimizer: Option<&ModelOptimizerState>,
    ) -> Result<()>;
}

/// Stores checkpoints as `iter_NNNNNNN/` directories holding a safetensors
/// model file and the optimizer state as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCheckpointStore;

impl FsCheckpointStore {
    fn iteration_dir(path: &Path, iteration: u64) -> PathBuf {
        path.join(format!("iter_{iteration:07}"))
    }

    fn read_model(dir: &Path, schema: &Arc<Schema>) -> Result<ParameterSet> {
        let file = dir.join(MODEL_FILE);
        let bytes = fs::read(&file).map_err(|e| ActorErr::checkpoint(&file, e))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| ActorErr::checkpoint(&file, invalid(e)))?;

        let mut named = Vec::with_capacity(schema.len());
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                let e = invalid(format!("tensor {name} is {:?}, expected F32", view.dtype()));
                return Err(ActorErr::checkpoint(&file, e));
            }

            if let Some(desc) = schema.position(&name).map(|i| &schema.descs()[i])
                && desc.shape != view.shape()
            {
                return Err(ActorErr::schema(
                    name,
                    format!("stored shape {:?}, expected {:?}", view.shape(), desc.shape),
                ));
            }

            let values = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            named.push((name, values));
        }

        ParameterSet::from_named(schema, Location::Host, named)
    }

    fn write_model(dir: &Path, params: &ParameterSet) -> Result<()> {
        let file = dir.join(MODEL_FILE);
        let views = params
            .iter()
            .map(|(desc, values)| {
                let view = TensorView::new(Dtype::F32, desc.shape.clone(), bytemuck::cast_slice(values))
                    .map_err(|e| ActorErr::checkpoint(&file, invalid(e)))?;
                Ok((desc.name.clone(), view))
            })
            .collect::<Result<BTreeMap<String, TensorView<'_>>>>()?;

        let bytes =
            safetensors::serialize(&views, &None).map_err(|e| ActorErr::checkpoint(&file, invalid(e)))?;
        fs::write(&file, bytes).map_err(|e| ActorErr::checkpoint(&file, e))
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn latest_iteration(&self, path: &Path) -> Result<Option<u64>> {
        let tracker = path.join(TRACKER_FILE);
        match fs::read_to_string(&tracker) {
            Ok(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ActorErr::checkpoint(&tracker, invalid(e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ActorErr::checkpoint(&tracker, e)),
        }
    }

    fn has_checkpoint(&self, path: &Path) -> Result<bool> {
        Ok(self.latest_iteration(path)?.is_some() || path.join(MODEL_FILE).is_file())
    }

    fn load(&self, path: &Path, schema: &Arc<Schema>) -> Result<Checkpoint> {
        let (iteration, dir) = match self.latest_iteration(path)? {
            Some(iteration) => (Some(iteration), Self::iteration_dir(path, iteration)),
            None if path.join(MODEL_FILE).is_file() => (None, path.to_path_buf()),
            None => {
                let e = io::Error::new(io::ErrorKind::NotFound, "no checkpoint found");
                return Err(ActorErr::checkpoint(path, e));
            }
        };

        let params = Self::read_model(&dir, schema)?;

        let optimizer_file = dir.join(OPTIMIZER_FILE);
        let optimizer = match fs::read(&optimizer_file) {
            Ok(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| ActorErr::checkpoint(&optimizer_file, e.into()))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(ActorErr::checkpoint(&optimizer_file, e)),
        };

        info!("loaded checkpoint {iteration:?} from {}", dir.display());
        Ok(Checkpoint {
            iteration,
            params,
            optimizer,
        })
    }

    fn save(
        &self,
        path: &Path,
        iteration: u64,
        params: &ParameterSet,
        optimizer: Option<&ModelOptimizerState>,
    ) -> Result<()> {
        let dir = Self::iteration_dir(path, iteration);
        let staging = dir.with_extension("tmp");

        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| ActorErr::checkpoint(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| ActorErr::checkpoint(&staging, e))?;

        Self::write_model(&staging, params)?;

        if let Some(state) = optimizer {
            let file = staging.join(OPTIMIZER_FILE);
            let bytes = serde_json::to_vec(state).map_err(|e| ActorErr::checkpoint(&file, e.into()))?;
            fs::write(&file, bytes).map_err(|e| ActorErr::checkpoint(&file, e))?;
        }

        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| ActorErr::checkpoint(&dir, e))?;
        }
        fs::rename(&staging, &dir).map_err(|e| ActorErr::checkpoint(&dir, e))?;

        let tracker = path.join(TRACKER_FILE);
        let tmp = tracker.with_extension("tmp");
        fs::write(&tmp, iteration.to_string()).map_err(|e| ActorErr::checkpoint(&tmp, e))?;
        fs::rename(&tmp, &tracker).map_err(|e| ActorErr::checkpoint(&tracker, e))?;

        info!("saved checkpoint iteration {iteration} to {}", dir.display());
        Ok(())
    }
}

fn invalid(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{params::TensorDesc, training::optimization::OptimizerState};

    fn tempdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("train_actor_ckpt_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn schema() -> Arc<Schema> {
        Schema::new(vec![
            TensorDesc::new("w", vec![2, 2]),
            TensorDesc::new("b", vec![2]),
        ])
        .unwrap()
    }

    #[test]
    fn save_then_load_is_exact() {
        let dir = tempdir("exact");
        let schema = schema();
        let params = ParameterSet::from_tensors(
            &schema,
            Location::Device,
            vec![vec![0.1, -0.2, 1e-7, 3.5], vec![f32::MIN_POSITIVE, 2.]],
        )
        .unwrap();
        let optimizer: ModelOptimizerState = [(
            "w".to_string(),
            OptimizerState {
                step: 3,
                buffers: vec![vec![1.; 4]],
            },
        )]
        .into();

        let store = FsCheckpointStore;
        assert_eq!(store.latest_iteration(&dir).unwrap(), None);
        store.save(&dir, 4, &params, Some(&optimizer)).unwrap();
        assert_eq!(store.latest_iteration(&dir).unwrap(), Some(4));

        let ckpt = store.load(&dir, &schema).unwrap();
        assert_eq!(ckpt.iteration, Some(4));
        assert_eq!(ckpt.params.tensor(0), params.tensor(0));
        assert_eq!(ckpt.params.tensor(1), params.tensor(1));
        assert_eq!(ckpt.optimizer, Some(optimizer));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bare_model_has_no_iteration() {
        let dir = tempdir("bare");
        let schema = schema();
        FsCheckpointStore
            .save(&dir, 9, &ParameterSet::zeros(&schema, Location::Host), None)
            .unwrap();
        let bare = dir.join("iter_0000009");

        let ckpt = FsCheckpointStore.load(&bare, &schema).unwrap();
        assert_eq!(ckpt.iteration, None);
        assert_eq!(ckpt.optimizer, None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_checkpoint_is_checkpoint_io() {
        let dir = tempdir("missing");
        let err = FsCheckpointStore.load(&dir, &schema()).unwrap_err();
        assert!(matches!(err, ActorErr::CheckpointIo { .. }));
    }

    #[test]
    fn tracker_without_its_iteration_is_still_a_checkpoint() {
        let dir = tempdir("dangling");
        let schema = schema();
        assert!(!FsCheckpointStore.has_checkpoint(&dir).unwrap());

        FsCheckpointStore
            .save(&dir, 41, &ParameterSet::zeros(&schema, Location::Host), None)
            .unwrap();
        fs::remove_dir_all(dir.join("iter_0000041")).unwrap();

        assert!(FsCheckpointStore.has_checkpoint(&dir).unwrap());
        let err = FsCheckpointStore.load(&dir, &schema).unwrap_err();
        assert!(matches!(err, ActorErr::CheckpointIo { .. }));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let dir = tempdir("foreign");
        let schema = schema();
        FsCheckpointStore
            .save(&dir, 0, &ParameterSet::zeros(&schema, Location::Host), None)
            .unwrap();

        let other = Schema::new(vec![TensorDesc::new("w", vec![4])]).unwrap();
        let err = FsCheckpointStore.load(&dir, &other).unwrap_err();
        assert!(matches!(err, ActorErr::SchemaMismatch { .. }));

        fs::remove_dir_all(&dir).unwrap();
    }
}

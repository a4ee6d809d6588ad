use std::{path::Path, sync::Arc};

use log::{debug, info};

use super::{StateMachine, TrainingState};
use crate::{
    ActorConfig, RolloutId,
    checkpoint::CheckpointStore,
    collective::ProcessGroup,
    error::{ActorErr, Result},
    gateway::RolloutDataGateway,
    memory::{DeviceAllocator, DeviceMemoryLifecycle, OffloadTags},
    observability::{MetricsSink, Timer},
    params::{ParameterStore, Role},
    rollout::RolloutData,
    sync::{EngineHandle, EngineLock, WeightSynchronizer, WeightUpdater, WeightVersion},
    training::{PolicyModel, optimization::OptimizerGroup},
};

/// Runs on the rollout data after advantages are computed and before training.
pub type PostprocessHook = Box<dyn Fn(&mut RolloutData) -> Result<()> + Send + Sync>;

/// Everything that only exists when the actor holds a model.
pub(super) struct TrainEngine {
    pub store: ParameterStore,
    pub optimizer: OptimizerGroup,
    pub lifecycle: DeviceMemoryLifecycle,
    pub updater: WeightUpdater,
}

/// Drives one data-parallel rank of the actor through its training steps.
///
/// Owns the parameter store, so every operation that touches weights takes
/// `&mut self` and training steps can't overlap.
pub struct TrainingStepOrchestrator {
    pub(super) config: ActorConfig,
    pub(super) policy: Arc<dyn PolicyModel>,
    pub(super) checkpoints: Arc<dyn CheckpointStore>,
    pub(super) gateway: Option<Arc<dyn RolloutDataGateway>>,
    pub(super) metrics: Box<dyn MetricsSink>,
    pub(super) postprocess: Option<PostprocessHook>,
    pub(super) group: ProcessGroup,
    pub(super) allocator: Arc<DeviceAllocator>,
    pub(super) timer: Arc<Timer>,
    pub(super) machine: StateMachine,
    /// `None` when debugging the rollout side only.
    pub(super) engine: Option<TrainEngine>,
    pub(super) run_id: String,
    pub(super) start_rollout_id: RolloutId,
    pub(super) last_rollout: Option<RolloutId>,
}

impl TrainingStepOrchestrator {
    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    pub fn state(&self) -> TrainingState {
        self.machine.current()
    }

    /// The states visited during the last training step.
    pub fn trace(&self) -> &[TrainingState] {
        self.machine.trace()
    }

    /// Identifies this training run, forwarded to the data gateway.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The first rollout id to train on, one past the loaded checkpoint.
    pub fn start_rollout_id(&self) -> RolloutId {
        self.start_rollout_id
    }

    pub fn last_rollout_id(&self) -> Option<RolloutId> {
        self.last_rollout
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// The parameter store, `None` when debugging the rollout side only.
    pub fn store(&self) -> Option<&ParameterStore> {
        self.engine.as_ref().map(|e| &e.store)
    }

    pub fn updater(&self) -> Option<&WeightUpdater> {
        self.engine.as_ref().map(|e| &e.updater)
    }

    /// Sets where rollout data is fetched from and announces the run id to it.
    pub fn set_data_gateway(&mut self, gateway: Arc<dyn RolloutDataGateway>) {
        info!("updating the data gateway's run id to {}", self.run_id);
        gateway.update_run_id(&self.run_id);
        self.gateway = Some(gateway);
    }

    /// Registers the rollout engines weights are pushed to.
    ///
    /// Does nothing when debugging either side alone.
    ///
    /// # Arguments
    /// * `engines` - The rollout engines.
    /// * `lock` - The lock the rollout side holds while serving.
    ///
    /// # Returns
    /// `AlreadyConnected` if engines were registered before.
    pub async fn connect_rollout_engines(
        &mut self,
        engines: Vec<EngineHandle>,
        lock: EngineLock,
    ) -> Result<()> {
        if self.config.debug_train_only || self.config.debug_rollout_only {
            debug!("skipping rollout engine connection while debugging");
            return Ok(());
        }

        let engine = self.engine_mut("connect_rollout_engines")?;
        engine.updater.connect_rollout_engines(engines, lock)?;
        self.group.barrier("connect_rollout_engines").await?;
        Ok(())
    }

    /// Forgets the registered rollout engines.
    pub fn disconnect_rollout_engines(&mut self) -> Option<Vec<EngineHandle>> {
        self.engine
            .as_ref()
            .and_then(|e| e.updater.disconnect_rollout_engines())
    }

    /// Publishes the actor to every rollout engine.
    ///
    /// An offloaded actor is pushed from its host snapshot. The old actor snapshot, when kept, is refreshed once the push succeeds.
    ///
    /// # Returns
    /// The committed version, `None` when debugging either side alone, or
    /// `PartialSync` if any engine failed to commit.
    pub async fn update_weights(&mut self) -> Result<Option<WeightVersion>> {
        if self.config.debug_train_only || self.config.debug_rollout_only {
            return Ok(None);
        }

        let timer = Arc::clone(&self.timer);
        let _update = timer.scope("update_weights");

        let engine = self.engine_mut("update_weights")?;
        let version = engine.updater.update_weights(&engine.store).await?;
        self.group.barrier("update_weights").await?;

        let engine = self.engine_mut("update_weights")?;
        if engine.store.has_role(Role::OldActor) {
            engine.store.snapshot_actor_as(Role::OldActor)?;
            debug!("refreshed the old actor from the actor at version {version}");
        }

        info!(
            "device memory after update_weights: {} bytes",
            self.allocator.used()
        );
        Ok(Some(version))
    }

    /// Releases the device memory of `tags`.
    ///
    /// # Returns
    /// `UnsupportedOperation` unless configured to offload, `StateConflict` mid-step.
    pub fn offload(&mut self, tags: &OffloadTags) -> Result<()> {
        let state = self.machine.current();
        let timer = Arc::clone(&self.timer);
        let _offload = timer.scope("offload");

        match self.engine.as_mut() {
            Some(engine) => engine.lifecycle.offload(&mut engine.store, tags, state),
            None => Ok(()),
        }
    }

    /// Reacquires the device memory of `tags`, restoring the actor's weights.
    ///
    /// # Returns
    /// `UnsupportedOperation` unless configured to offload, `StateConflict` mid-step.
    pub fn wake_up(&mut self, tags: &OffloadTags) -> Result<()> {
        let state = self.machine.current();
        let timer = Arc::clone(&self.timer);
        let _wake_up = timer.scope("wake_up");

        match self.engine.as_mut() {
            Some(engine) => engine.lifecycle.wake_up(&mut engine.store, tags, state),
            None => Ok(()),
        }
    }

    /// Loads the weights under `path` as the host snapshot of `role`.
    ///
    /// The live model goes back to the role it held before, so the actor's
    /// weights are left exactly as they were.
    ///
    /// # Arguments
    /// * `role` - The secondary role to load.
    /// * `path` - The checkpoint root.
    ///
    /// # Returns
    /// `CheckpointIo` or `SchemaMismatch` if the checkpoint can't be used.
    pub fn load_other_checkpoint(&mut self, role: Role, path: &Path) -> Result<()> {
        if role == Role::Actor {
            return Err(ActorErr::UnsupportedOperation {
                op: "load_other_checkpoint",
                reason: "the actor is only loaded at startup",
            });
        }

        let checkpoints = Arc::clone(&self.checkpoints);
        let engine = self.engine_mut("load_other_checkpoint")?;
        let store = &mut engine.store;

        let previous = store.live_role();
        if previous == Role::Actor {
            store.snapshot_to_host(Role::Actor)?;
        }

        let checkpoint = checkpoints.load(path, store.schema())?;
        store.load_live(&checkpoint.params, role)?;
        store.snapshot_to_host(role)?;
        store.restore_from_host(previous)?;

        info!("loaded {role} weights from {}", path.display());
        Ok(())
    }

    /// Persists the actor and optionally its optimizer state.
    ///
    /// Only the root rank writes, every rank holds the same weights.
    ///
    /// # Arguments
    /// * `iteration` - The iteration to save as.
    /// * `with_optimizer` - Whether to save the optimizer state too.
    pub fn save_model(&self, iteration: u64, with_optimizer: bool) -> Result<()> {
        if self.config.debug_rollout_only {
            return Ok(());
        }

        let Some(path) = self.config.save.as_deref() else {
            return Err(ActorErr::InvalidConfig("save_model needs a save path".into()));
        };

        self.save_to(path, iteration, with_optimizer)
    }

    pub(super) fn save_to(&self, path: &Path, iteration: u64, with_optimizer: bool) -> Result<()> {
        if !self.group.is_root() {
            return Ok(());
        }

        let engine = self.engine_ref("save_model")?;
        let optimizer = with_optimizer.then(|| engine.optimizer.export());
        self.checkpoints
            .save(path, iteration, engine.store.actor_weights()?, optimizer.as_ref())
    }

    pub(super) fn engine_ref(&self, op: &'static str) -> Result<&TrainEngine> {
        self.engine.as_ref().ok_or(ActorErr::UnsupportedOperation {
            op,
            reason: "debug_rollout_only builds no model",
        })
    }

    pub(super) fn engine_mut(&mut self, op: &'static str) -> Result<&mut TrainEngine> {
        self.engine.as_mut().ok_or(ActorErr::UnsupportedOperation {
            op,
            reason: "debug_rollout_only builds no model",
        })
    }
}

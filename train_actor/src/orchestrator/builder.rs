use std::sync::Arc;

use log::info;

use super::{
    PostprocessHook, StateMachine, TRAIN_WAIT, TrainingStepOrchestrator, actor::TrainEngine,
};
use crate::{
    ActorConfig, RolloutId,
    checkpoint::CheckpointStore,
    collective::ProcessGroup,
    error::Result,
    gateway::RolloutDataGateway,
    memory::{DeviceAllocator, DeviceMemoryLifecycle, MODEL_TAG, OPTIMIZER_TAG, tags},
    observability::{LogSink, MetricsSink, Timer},
    params::{Location, ParameterSet, ParameterStore, Role, Schema},
    sync::WeightUpdater,
    training::{PolicyModel, optimization::OptimizerGroup},
};

/// Assembles a `TrainingStepOrchestrator` out of its collaborators.
pub struct OrchestratorBuilder {
    config: ActorConfig,
    policy: Arc<dyn PolicyModel>,
    checkpoints: Arc<dyn CheckpointStore>,
    gateway: Option<Arc<dyn RolloutDataGateway>>,
    metrics: Box<dyn MetricsSink>,
    postprocess: Option<PostprocessHook>,
    group: ProcessGroup,
    allocator: Option<Arc<DeviceAllocator>>,
    timer: Arc<Timer>,
}

impl OrchestratorBuilder {
    /// Creates a new `OrchestratorBuilder` for a single rank logging its metrics.
    ///
    /// # Arguments
    /// * `config` - The actor's configuration.
    /// * `policy` - The model to train.
    /// * `checkpoints` - Where weights are loaded from and saved to.
    ///
    /// # Returns
    /// A new `OrchestratorBuilder` instance.
    pub fn new(
        config: ActorConfig,
        policy: Arc<dyn PolicyModel>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            policy,
            checkpoints,
            gateway: None,
            metrics: Box::new(LogSink),
            postprocess: None,
            group: ProcessGroup::single(),
            allocator: None,
            timer: Arc::new(Timer::new()),
        }
    }

    pub fn gateway(mut self, gateway: Arc<dyn RolloutDataGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn metrics(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.metrics = Box::new(sink);
        self
    }

    pub fn postprocess(mut self, hook: PostprocessHook) -> Self {
        self.postprocess = Some(hook);
        self
    }

    /// Sets this rank's data-parallel process group.
    pub fn group(mut self, group: ProcessGroup) -> Self {
        self.group = group;
        self
    }

    /// Shares a process-wide device allocator, one sized by the configuration is made otherwise.
    pub fn allocator(mut self, allocator: Arc<DeviceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn timer(mut self, timer: Arc<Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Builds the model, loads every configured role and waits for the whole group.
    ///
    /// # Returns
    /// The orchestrator along with the first rollout id to train on, one past
    /// the loaded checkpoint's iteration.
    pub async fn init(self) -> Result<(TrainingStepOrchestrator, RolloutId)> {
        self.config.validate()?;

        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(DeviceAllocator::new(self.config.device_memory_bytes)));
        let run_id = format!("{:016x}", rand::random::<u64>());

        let mut orchestrator = TrainingStepOrchestrator {
            config: self.config,
            policy: self.policy,
            checkpoints: self.checkpoints,
            gateway: None,
            metrics: self.metrics,
            postprocess: self.postprocess,
            group: self.group,
            allocator,
            timer: self.timer,
            machine: StateMachine::default(),
            engine: None,
            run_id,
            start_rollout_id: 0,
            last_rollout: None,
        };

        if let Some(gateway) = self.gateway {
            orchestrator.set_data_gateway(gateway);
        }

        if orchestrator.config.debug_rollout_only {
            info!("debugging the rollout side only, no model is built");
            orchestrator.timer.start(TRAIN_WAIT);
            return Ok((orchestrator, 0));
        }

        let start_rollout_id = build_engine(&mut orchestrator)?;
        orchestrator.start_rollout_id = start_rollout_id;

        if let Some(path) = orchestrator.config.ref_load.clone() {
            orchestrator.load_other_checkpoint(Role::Reference, &path)?;
        }

        if orchestrator.config.keep_old_actor {
            let engine = orchestrator.engine_mut("init")?;
            engine.store.snapshot_to_host(Role::OldActor)?;
        }

        if orchestrator.config.offload {
            orchestrator.offload(&tags([MODEL_TAG]))?;
        }

        orchestrator.group.barrier("init").await?;
        orchestrator.timer.start(TRAIN_WAIT);

        info!(
            "actor rank {} of run {} starts at rollout {start_rollout_id}",
            orchestrator.group.rank(),
            orchestrator.run_id
        );
        Ok((orchestrator, start_rollout_id))
    }
}

/// Builds the live model, its optimizer and the weight updater.
///
/// # Returns
/// The first rollout id to train on.
fn build_engine(orchestrator: &mut TrainingStepOrchestrator) -> Result<RolloutId> {
    let config = &orchestrator.config;
    let policy = &orchestrator.policy;
    let schema = Schema::new(policy.schema())?;

    let (initial, optimizer_state, start_rollout_id) = match &config.load {
        // a checkpoint that exists but can't be read is never replaced by fresh weights
        Some(path) if orchestrator.checkpoints.has_checkpoint(path)? => {
            let ckpt = orchestrator.checkpoints.load(path, &schema)?;
            (ckpt.params, ckpt.optimizer, ckpt.iteration.map_or(0, |i| i + 1))
        }
        Some(path) => {
            info!("no checkpoint under {}, starting from scratch", path.display());
            (initial_weights(policy.as_ref(), &schema, config.seed)?, None, 0)
        }
        None => (initial_weights(policy.as_ref(), &schema, config.seed)?, None, 0),
    };

    let allocator = &orchestrator.allocator;
    allocator.reserve(MODEL_TAG, schema.nbytes())?;
    allocator.reserve(
        OPTIMIZER_TAG,
        OptimizerGroup::state_bytes(&config.optimizer, &schema),
    )?;

    let mut store = ParameterStore::new(initial);
    store.snapshot_to_host(Role::Actor)?;

    let mut optimizer = OptimizerGroup::new(&config.optimizer, &schema);
    if let Some(state) = optimizer_state {
        optimizer.import(state)?;
    }

    let updater = WeightUpdater::new(
        config.colocate,
        orchestrator.group.clone(),
        config.update_weight_buffer_size.get(),
        config.sync_timeout(),
    );

    orchestrator.engine = Some(TrainEngine {
        store,
        optimizer,
        lifecycle: DeviceMemoryLifecycle::new(config.offload, Arc::clone(allocator)),
        updater,
    });

    Ok(start_rollout_id)
}

fn initial_weights(
    policy: &dyn PolicyModel,
    schema: &Arc<Schema>,
    seed: Option<u64>,
) -> Result<ParameterSet> {
    ParameterSet::from_tensors(schema, Location::Device, policy.init(seed.unwrap_or_default()))
}

use std::{
    fs,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ActorErr, Result},
    rollout::{DecodeFailurePolicy, MicrobatchPolicy},
    training::{AdvantageEstimator, LossConfig, optimization::OptimizerSpec},
};

const DEFAULT_MICRO_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(4).unwrap();
const DEFAULT_BUFFER_SIZE: NonZeroUsize = NonZeroUsize::new(512 << 20).unwrap();

/// Everything the actor is configured with.
///
/// Every field has a default, so a JSON document only needs the ones it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Move the model off the device while the rollout engines generate.
    pub offload: bool,
    /// Training and rollout engines share the same devices.
    pub colocate: bool,
    /// Compute the behavior policy's log-probabilities with a frozen copy of
    /// the actor taken at the last weight update.
    pub keep_old_actor: bool,
    pub debug_rollout_only: bool,
    pub debug_train_only: bool,
    /// Take the behavior policy's log-probabilities from the rollout engines.
    pub use_rollout_log_probs: bool,

    pub micro_batch_size: NonZeroUsize,
    /// Microbatch size of log-probability passes, `micro_batch_size` when unset.
    pub log_probs_micro_batch_size: Option<NonZeroUsize>,
    /// Group microbatches by token budget instead of sample count.
    pub max_tokens_per_microbatch: Option<NonZeroUsize>,
    /// Samples per optimizer step across every rank, the whole rollout when unset.
    pub global_batch_size: Option<NonZeroUsize>,

    pub optimizer: OptimizerSpec,
    pub advantage_estimator: AdvantageEstimator,
    pub loss: LossConfig,

    pub load: Option<PathBuf>,
    pub ref_load: Option<PathBuf>,
    pub save: Option<PathBuf>,
    pub save_interval: Option<NonZeroU64>,
    /// Path template with `{rollout_id}` and `{rank}` placeholders.
    pub save_debug_train_data: Option<String>,

    /// Upper bound of a weight update bucket, in bytes.
    pub update_weight_buffer_size: NonZeroUsize,
    pub sync_timeout_ms: u64,
    pub collective_timeout_ms: u64,
    pub device_memory_bytes: usize,

    pub decode_failure_policy: DecodeFailurePolicy,
    pub seed: Option<u64>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            offload: false,
            colocate: false,
            keep_old_actor: false,
            debug_rollout_only: false,
            debug_train_only: false,
            use_rollout_log_probs: false,
            micro_batch_size: DEFAULT_MICRO_BATCH_SIZE,
            log_probs_micro_batch_size: None,
            max_tokens_per_microbatch: None,
            global_batch_size: None,
            optimizer: OptimizerSpec::default(),
            advantage_estimator: AdvantageEstimator::default(),
            loss: LossConfig::default(),
            load: None,
            ref_load: None,
            save: None,
            save_interval: None,
            save_debug_train_data: None,
            update_weight_buffer_size: DEFAULT_BUFFER_SIZE,
            sync_timeout_ms: 30_000,
            collective_timeout_ms: 60_000,
            device_memory_bytes: usize::MAX,
            decode_failure_policy: DecodeFailurePolicy::default(),
            seed: None,
        }
    }
}

impl ActorConfig {
    /// Reads a JSON configuration file.
    ///
    /// # Arguments
    /// * `path` - The file to read.
    ///
    /// # Returns
    /// The validated configuration.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| ActorErr::InvalidConfig(format!("{}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects contradicting settings.
    pub fn validate(&self) -> Result<()> {
        if self.debug_rollout_only && self.debug_train_only {
            return Err(ActorErr::InvalidConfig(
                "debug_rollout_only and debug_train_only are mutually exclusive".into(),
            ));
        }

        if self.offload && !self.colocate {
            return Err(ActorErr::InvalidConfig(
                "offload requires colocated rollout engines".into(),
            ));
        }

        if self.save_interval.is_some() && self.save.is_none() {
            return Err(ActorErr::InvalidConfig(
                "save_interval is set but save has no path".into(),
            ));
        }

        if let Some(template) = &self.save_debug_train_data
            && !template.contains("{rollout_id}")
        {
            return Err(ActorErr::InvalidConfig(format!(
                "save_debug_train_data {template:?} has no {{rollout_id}} placeholder"
            )));
        }

        if self.sync_timeout_ms == 0 || self.collective_timeout_ms == 0 {
            return Err(ActorErr::InvalidConfig("timeouts must be positive".into()));
        }

        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }

    /// How training microbatches are grouped.
    pub fn train_microbatches(&self) -> MicrobatchPolicy {
        match self.max_tokens_per_microbatch {
            Some(budget) => MicrobatchPolicy::MaxTokens(budget),
            None => MicrobatchPolicy::Fixed(self.micro_batch_size),
        }
    }

    /// How log-probability microbatches are grouped.
    pub fn log_probs_microbatches(&self) -> MicrobatchPolicy {
        match (self.max_tokens_per_microbatch, self.log_probs_micro_batch_size) {
            (Some(budget), _) => MicrobatchPolicy::MaxTokens(budget),
            (None, size) => MicrobatchPolicy::Fixed(size.unwrap_or(self.micro_batch_size)),
        }
    }

    /// Whether `rollout_id` ends a checkpoint interval.
    pub fn should_save(&self, rollout_id: u64) -> bool {
        self.save_interval
            .is_some_and(|interval| (rollout_id + 1) % interval.get() == 0)
    }
}

use std::{num::NonZeroUsize, sync::Arc};

use log::{debug, error, warn};
use rayon::prelude::*;

use super::{TRAIN_WAIT, TrainingState, TrainingStepOrchestrator, actor::TrainEngine};
use crate::{
    RolloutId,
    collective::ProcessGroup,
    error::{ActorErr, Result},
    gateway::RolloutDataGateway,
    memory::{MODEL_TAG, OPTIMIZER_TAG, tags},
    observability::{Metrics, log_metrics, rollout_metrics, save_debug_train_data},
    params::{Location, ParameterSet, Role},
    rollout::{
        ADVANTAGES, DataIterators, DataRef, LOG_PROBS, MicrobatchIter, RETURNS, RolloutBatch,
        RolloutData, log_probs_key,
    },
    training::{LossConfig, LossTerms, PolicyModel, policy_loss},
};

/// What a training step did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub rollout_id: RolloutId,
    /// The amount of samples this rank trained on.
    pub samples: usize,
    pub optimizer_steps: usize,
    /// Whether the step ended with a checkpoint.
    pub checkpointed: bool,
    pub metrics: Metrics,
}

impl TrainingStepOrchestrator {
    /// Trains the actor on the rollout behind `data_ref`.
    ///
    /// Rollout ids must strictly increase. Whatever happens, the actor is back
    /// in `Waiting` when this returns.
    ///
    /// # Arguments
    /// * `rollout_id` - The rollout the data was generated in.
    /// * `data_ref` - The gateway handle of the rollout data.
    ///
    /// # Returns
    /// What the step did, or a `Rollout` error naming the id and the state it failed in.
    pub async fn train(&mut self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<TrainReport> {
        if let Some(last) = self.last_rollout
            && rollout_id <= last
        {
            return Err(ActorErr::OutOfOrder { rollout_id, last });
        }

        self.timer.end(TRAIN_WAIT);
        self.machine.begin();

        let result = match self.engine.is_some() {
            true => self.train_step(rollout_id, data_ref).await,
            false => self.log_rollout_only(rollout_id, data_ref).await,
        };

        let state = self.machine.finish();
        self.log_perf_data(rollout_id);
        self.timer.start(TRAIN_WAIT);

        match result {
            Ok(report) => {
                self.last_rollout = Some(rollout_id);
                Ok(report)
            }
            Err(e) => {
                error!("rollout {rollout_id} failed while {state}: {e}");
                Err(ActorErr::Rollout {
                    rollout_id,
                    state,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Logs evaluation metrics of the rollout behind `data_ref`.
    ///
    /// # Returns
    /// The logged metrics, `None` when debugging the training side only.
    pub async fn eval(&self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<Option<Metrics>> {
        if self.config.debug_train_only {
            return Ok(None);
        }

        let batch = self.fetch(rollout_id, data_ref).await?;
        let data = RolloutData::new(rollout_id, batch, self.group.rank(), self.group.world_size());

        let metrics = rollout_metrics("eval", &data);
        log_metrics(self.metrics.as_ref(), rollout_id, &metrics);
        Ok(Some(metrics))
    }

    async fn fetch(&self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<RolloutBatch> {
        let gateway: &Arc<dyn RolloutDataGateway> = self
            .gateway
            .as_ref()
            .ok_or_else(|| ActorErr::Gateway("no rollout data gateway was set".into()))?;

        let mut batch = gateway.fetch(rollout_id, data_ref).await?;
        batch.assemble_episodes(self.config.decode_failure_policy);
        Ok(batch)
    }

    async fn log_rollout_only(
        &mut self,
        rollout_id: RolloutId,
        data_ref: &DataRef,
    ) -> Result<TrainReport> {
        let batch = self.fetch(rollout_id, data_ref).await?;
        let data = RolloutData::new(rollout_id, batch, self.group.rank(), self.group.world_size());

        self.machine.enter(TrainingState::Logging);
        let metrics = rollout_metrics("rollout", &data);
        log_metrics(self.metrics.as_ref(), rollout_id, &metrics);

        Ok(TrainReport {
            rollout_id,
            samples: data.len(),
            metrics,
            ..Default::default()
        })
    }

    async fn train_step(&mut self, rollout_id: RolloutId, data_ref: &DataRef) -> Result<TrainReport> {
        if self.config.offload {
            self.wake_up(&tags([MODEL_TAG]))?;
        }

        let timer = Arc::clone(&self.timer);
        let train_timer = timer.scope("train");

        let (mut data, mut iters) = {
            let _preprocess = timer.scope("data_preprocess");
            let batch = self.fetch(rollout_id, data_ref).await?;
            let data = RolloutData::new(rollout_id, batch, self.group.rank(), self.group.world_size());
            validate(&data)?;

            let global_batch_size = self
                .config
                .global_batch_size
                .or_else(|| NonZeroUsize::new(data.global_len()))
                .unwrap_or(NonZeroUsize::MIN);
            let iters = DataIterators::new(
                &data,
                global_batch_size,
                self.config.log_probs_microbatches(),
                self.config.train_microbatches(),
            );

            debug!(
                "rollout {rollout_id}: {} of {} samples, {} optimizer steps",
                data.len(),
                data.global_len(),
                iters.train_steps.len()
            );
            (data, iters)
        };

        let Some(engine) = self.engine.as_mut() else {
            return Err(ActorErr::UnsupportedOperation {
                op: "train",
                reason: "debug_rollout_only builds no model",
            });
        };
        let policy = self.policy.as_ref();

        if engine.store.has_role(Role::Reference) {
            self.machine.enter(TrainingState::ComputingLogProbs(Role::Reference));
            let _ref = timer.scope("ref_log_probs");
            compute_log_probs(policy, engine, Role::Reference, &mut data, &mut iters.log_probs)?;
        }

        if !self.config.use_rollout_log_probs || !take_rollout_log_probs(&mut data)? {
            let behavior = match engine.store.has_role(Role::OldActor) {
                true => Role::OldActor,
                false => Role::Actor,
            };

            self.machine.enter(TrainingState::ComputingLogProbs(behavior));
            let _log_probs = timer.scope("log_probs");
            compute_log_probs(policy, engine, behavior, &mut data, &mut iters.log_probs)?;
        }
        engine.store.activate(Role::Actor)?;

        self.machine.enter(TrainingState::ComputingAdvantages);
        let (advantages, returns) = self.config.advantage_estimator.compute(&data);
        data.insert(ADVANTAGES, advantages)?;
        data.insert(RETURNS, returns)?;

        if let Some(postprocess) = &self.postprocess {
            postprocess(&mut data)?;
        }

        self.machine.enter(TrainingState::Training);
        let mut metrics = {
            let _train = timer.scope("actor_train");
            train_actor(policy, engine, &self.group, &self.config.loss, &data, &mut iters).await?
        };
        drop(train_timer);

        self.machine.enter(TrainingState::Logging);
        metrics.extend(rollout_metrics("rollout", &data));
        log_metrics(self.metrics.as_ref(), rollout_id, &metrics);

        if let Some(template) = &self.config.save_debug_train_data {
            if let Err(e) = save_debug_train_data(template, rollout_id, self.group.rank(), &data) {
                warn!("failed to save debug train data of rollout {rollout_id}: {e}");
            }
        }

        let mut checkpointed = false;
        if let Some(path) = self.config.save.clone()
            && self.config.should_save(rollout_id)
        {
            self.machine.enter(TrainingState::Checkpointing);
            match self.save_to(&path, rollout_id, true) {
                Ok(()) => checkpointed = true,
                Err(e) => warn!(
                    "checkpoint of rollout {rollout_id} failed, the previous one stays the latest: {e}"
                ),
            }
        }

        Ok(TrainReport {
            rollout_id,
            samples: data.len(),
            optimizer_steps: iters.train_steps.len(),
            checkpointed,
            metrics,
        })
    }

    /// Logs and drains the accumulated timers.
    fn log_perf_data(&self, rollout_id: RolloutId) {
        let perf: Metrics = self
            .timer
            .take()
            .into_iter()
            .map(|(name, elapsed)| (format!("perf/{name}_time"), elapsed.as_secs_f64()))
            .collect();

        log_metrics(self.metrics.as_ref(), rollout_id, &perf);
    }
}

/// Rejects samples whose per-token fields don't line up with their response.
fn validate(data: &RolloutData) -> Result<()> {
    for sample in &data.samples {
        let len = sample.response_len();
        let mask_len = sample.loss_mask.as_ref().map_or(len, Vec::len);
        let cached_len = sample.rollout_log_probs.as_ref().map_or(len, Vec::len);

        if mask_len != len || cached_len != len {
            return Err(ActorErr::InvalidSample {
                index: sample.index,
                detail: format!(
                    "{len} response tokens, {mask_len} mask values, {cached_len} rollout log probs"
                ),
            });
        }
    }

    Ok(())
}

/// Uses the log-probabilities the rollout engines recorded as the behavior policy's.
///
/// # Returns
/// Whether every sample carried them.
fn take_rollout_log_probs(data: &mut RolloutData) -> Result<bool> {
    let cached: Option<Vec<Vec<f32>>> = data
        .samples
        .iter()
        .map(|s| s.rollout_log_probs.clone())
        .collect();

    match cached {
        Some(rows) => {
            data.insert(LOG_PROBS, rows)?;
            Ok(true)
        }
        None => {
            debug!("some samples carry no rollout log probs, recomputing them");
            Ok(false)
        }
    }
}

/// Runs a forward pass with `role`'s weights over every microbatch.
fn compute_log_probs(
    policy: &dyn PolicyModel,
    engine: &mut TrainEngine,
    role: Role,
    data: &mut RolloutData,
    iter: &mut MicrobatchIter,
) -> Result<()> {
    engine.store.activate(role)?;
    let params = engine.store.live_as(role)?;

    iter.reset();
    let mut rows = vec![Vec::new(); data.len()];
    for microbatch in iter.by_ref() {
        let computed = microbatch
            .par_iter()
            .map(|&i| policy.log_probs(params, &data.samples[i]).map(|lp| (i, lp)))
            .collect::<Result<Vec<_>>>()?;

        for (i, lp) in computed {
            rows[i] = lp;
        }
    }

    data.insert(log_probs_key(role), rows)
}

/// Runs one optimizer step per training step of the rollout.
///
/// Gradients are summed across the process group before every step, so each
/// sample's loss is weighted by the global size of its step.
async fn train_actor(
    policy: &dyn PolicyModel,
    engine: &mut TrainEngine,
    group: &ProcessGroup,
    loss: &LossConfig,
    data: &RolloutData,
    iters: &mut DataIterators,
) -> Result<Metrics> {
    if !engine.lifecycle.allocator().is_resident(OPTIMIZER_TAG) {
        return Err(ActorErr::NotResident {
            tag: OPTIMIZER_TAG.to_string(),
        });
    }

    let missing = |key: &str| ActorErr::schema(key, "missing per-token values");
    let old_log_probs = data.get(LOG_PROBS).ok_or_else(|| missing(LOG_PROBS))?;
    let advantages = data.get(ADVANTAGES).ok_or_else(|| missing(ADVANTAGES))?;
    let ref_log_probs = data.get(&log_probs_key(Role::Reference));

    let mut grads = ParameterSet::zeros(engine.store.schema(), Location::Device);
    let (mut pg_loss, mut kl, mut clipped, mut tokens) = (0., 0., 0, 0.);

    for (iter, &step_size) in iters.train_steps.iter_mut().zip(&iters.step_sizes) {
        grads.fill(0.);
        iter.reset();

        let params = engine.store.live_as(Role::Actor)?;
        for microbatch in iter.by_ref() {
            let terms = microbatch
                .par_iter()
                .map(|&i| -> Result<LossTerms> {
                    let sample = &data.samples[i];
                    let log_probs = policy.log_probs(params, sample)?;
                    let mask = sample.mask();
                    let denom = mask.iter().sum::<f32>().max(1.) * step_size as f32;

                    Ok(policy_loss(
                        loss,
                        &log_probs,
                        &old_log_probs[i],
                        ref_log_probs.map(|r| r[i].as_slice()),
                        &advantages[i],
                        &mask,
                        denom,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;

            for (&i, t) in microbatch.iter().zip(&terms) {
                policy.backward(params, &data.samples[i], &t.coeffs, &mut grads)?;
                pg_loss += t.pg_loss;
                kl += t.kl;
                clipped += t.clipped;
                tokens += data.samples[i].mask().iter().sum::<f32>();
            }
        }

        for i in 0..grads.tensors().len() {
            group.all_reduce_sum(grads.tensor_mut(i)).await?;
        }

        engine.optimizer.step(&grads, engine.store.live_mut()?)?;
    }

    let steps = iters.train_steps.len().max(1) as f64;
    Ok(Metrics::from([
        ("train/pg_loss".to_string(), pg_loss as f64 / steps),
        ("train/kl".to_string(), kl as f64 / steps),
        ("train/clip_fraction".to_string(), clipped as f64 / tokens.max(1.) as f64),
    ]))
}

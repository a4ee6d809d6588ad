use std::sync::Arc;

use log::info;

use super::{DeviceAllocator, MODEL_TAG, OffloadTags};
use crate::{
    error::{ActorErr, Result},
    orchestrator::TrainingState,
    params::{ParameterStore, Role},
};

/// Frees and reacquires tagged device memory around rollout generation.
///
/// Both transitions are idempotent, offloading an offloaded tag or waking up a
/// resident one does nothing.
#[derive(Debug, Clone)]
pub struct DeviceMemoryLifecycle {
    enabled: bool,
    allocator: Arc<DeviceAllocator>,
}

impl DeviceMemoryLifecycle {
    /// Creates a new `DeviceMemoryLifecycle`.
    ///
    /// # Arguments
    /// * `enabled` - Whether the actor was configured to offload.
    /// * `allocator` - The process-wide device allocator.
    ///
    /// # Returns
    /// A new `DeviceMemoryLifecycle` instance.
    pub fn new(enabled: bool, allocator: Arc<DeviceAllocator>) -> Self {
        Self { enabled, allocator }
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    /// Releases the device memory tagged with any of `tags`.
    ///
    /// The live actor is saved to its host snapshot before the model's memory is released.
    ///
    /// # Arguments
    /// * `store` - The parameter store owning the live model.
    /// * `tags` - The memory categories to release.
    /// * `state` - The actor's current training state.
    ///
    /// # Returns
    /// An error if offloading is disabled, the state forbids it or the live
    /// model doesn't hold the actor.
    pub fn offload(
        &self,
        store: &mut ParameterStore,
        tags: &OffloadTags,
        state: TrainingState,
    ) -> Result<()> {
        self.check("offload", state)?;
        let _guard = self.allocator.exclusive();

        let pending: OffloadTags = tags
            .iter()
            .filter(|tag| self.allocator.is_resident(tag))
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let before = self.allocator.used();

        if pending.contains(MODEL_TAG) && store.is_resident() {
            if store.live_role() != Role::Actor {
                return Err(ActorErr::LiveRoleMismatch {
                    expected: Role::Actor,
                    found: store.live_role(),
                });
            }

            store.snapshot_to_host(Role::Actor)?;
            store.release_device();
        }

        self.allocator.sleep(&pending);
        info!(
            "offloaded {pending:?}: device memory {before} -> {} bytes",
            self.allocator.used()
        );

        Ok(())
    }

    /// Reacquires the device memory tagged with any of `tags`.
    ///
    /// The live model is refilled from the actor's host snapshot when the model's memory comes back.
    ///
    /// # Arguments
    /// * `store` - The parameter store owning the live model.
    /// * `tags` - The memory categories to reacquire.
    /// * `state` - The actor's current training state.
    ///
    /// # Returns
    /// An error if offloading is disabled, the state forbids it or the memory doesn't fit.
    pub fn wake_up(
        &self,
        store: &mut ParameterStore,
        tags: &OffloadTags,
        state: TrainingState,
    ) -> Result<()> {
        self.check("wake_up", state)?;
        let _guard = self.allocator.exclusive();

        let pending: OffloadTags = tags
            .iter()
            .filter(|tag| !self.allocator.is_resident(tag))
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let before = self.allocator.used();
        self.allocator.wake_up(&pending)?;

        if pending.contains(MODEL_TAG) {
            store.reacquire_device();
            store.restore_from_host(Role::Actor)?;
        }

        info!(
            "woke up {pending:?}: device memory {before} -> {} bytes",
            self.allocator.used()
        );

        Ok(())
    }

    fn check(&self, op: &'static str, state: TrainingState) -> Result<()> {
        if !self.enabled {
            return Err(ActorErr::UnsupportedOperation {
                op,
                reason: "offloading is disabled",
            });
        }

        if !state.allows_memory_transition() {
            return Err(ActorErr::StateConflict { op, state });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{OPTIMIZER_TAG, tags},
        params::{Location, ParameterSet, Schema, TensorDesc},
    };

    fn setup(enabled: bool) -> (DeviceMemoryLifecycle, ParameterStore) {
        let schema = Schema::new(vec![TensorDesc::new("w", vec![4])]).unwrap();
        let initial =
            ParameterSet::from_tensors(&schema, Location::Host, vec![vec![1., 2., 3., 4.]])
                .unwrap();
        let store = ParameterStore::new(initial);

        let allocator = Arc::new(DeviceAllocator::new(1 << 20));
        allocator.reserve(MODEL_TAG, schema.nbytes()).unwrap();
        allocator.reserve(OPTIMIZER_TAG, 32).unwrap();

        (DeviceMemoryLifecycle::new(enabled, allocator), store)
    }

    #[test]
    fn offload_then_wake_up_restores_actor() {
        let (lifecycle, mut store) = setup(true);
        let model = tags([MODEL_TAG]);

        lifecycle
            .offload(&mut store, &model, TrainingState::Waiting)
            .unwrap();
        assert!(!store.is_resident());
        assert_eq!(lifecycle.allocator().used(), 32);

        lifecycle
            .wake_up(&mut store, &model, TrainingState::Preprocessing)
            .unwrap();
        assert_eq!(store.live().unwrap().tensor(0), &[1., 2., 3., 4.]);
        assert_eq!(lifecycle.allocator().used(), 48);
    }

    #[test]
    fn transitions_are_idempotent() {
        let (lifecycle, mut store) = setup(true);
        let model = tags([MODEL_TAG]);

        lifecycle
            .wake_up(&mut store, &model, TrainingState::Waiting)
            .unwrap();
        lifecycle
            .wake_up(&mut store, &model, TrainingState::Waiting)
            .unwrap();
        assert_eq!(lifecycle.allocator().used(), 48);

        lifecycle
            .offload(&mut store, &model, TrainingState::Waiting)
            .unwrap();
        lifecycle
            .offload(&mut store, &model, TrainingState::Waiting)
            .unwrap();
        assert_eq!(lifecycle.allocator().used(), 32);
    }

    #[test]
    fn disabled_offload_is_unsupported() {
        let (lifecycle, mut store) = setup(false);
        let err = lifecycle
            .offload(&mut store, &tags([MODEL_TAG]), TrainingState::Waiting)
            .unwrap_err();
        assert!(matches!(err, ActorErr::UnsupportedOperation { op: "offload", .. }));
    }

    #[test]
    fn offload_rejected_while_training() {
        let (lifecycle, mut store) = setup(true);
        let err = lifecycle
            .offload(&mut store, &tags([MODEL_TAG]), TrainingState::Training)
            .unwrap_err();

        assert!(matches!(
            err,
            ActorErr::StateConflict {
                state: TrainingState::Training,
                ..
            }
        ));
        assert!(store.is_resident());
    }

    #[test]
    fn offload_refuses_non_actor_live_model() {
        let (lifecycle, mut store) = setup(true);
        store.snapshot_to_host(Role::Reference).unwrap();
        store.snapshot_to_host(Role::Actor).unwrap();
        store.restore_from_host(Role::Reference).unwrap();

        let err = lifecycle
            .offload(&mut store, &tags([MODEL_TAG]), TrainingState::Waiting)
            .unwrap_err();
        assert!(matches!(err, ActorErr::LiveRoleMismatch { .. }));
    }
}

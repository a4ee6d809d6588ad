use std::{collections::BTreeMap, sync::Arc};

use log::debug;

use super::{Location, ParameterSet, Role, Schema};
use crate::error::{ActorErr, Result};

/// A host-resident copy of one role's weights.
pub type WeightSnapshot = ParameterSet;

/// Owns the single live (device) model and the host snapshots of every role.
///
/// The live model holds exactly one role at a time. Snapshots of the reference
/// and old actor roles are immutable once taken, the actor snapshot is refreshed
/// whenever the live model is about to be swapped away or offloaded.
#[derive(Debug)]
pub struct ParameterStore {
    schema: Arc<Schema>,
    live: Option<ParameterSet>,
    live_role: Role,
    snapshots: BTreeMap<Role, WeightSnapshot>,
}

impl ParameterStore {
    /// Creates a new `ParameterStore` holding `initial` as the live actor.
    ///
    /// # Arguments
    /// * `initial` - The actor's starting weights.
    ///
    /// # Returns
    /// A new `ParameterStore` instance without any snapshot.
    pub fn new(initial: ParameterSet) -> Self {
        Self {
            schema: Arc::clone(initial.schema()),
            live: Some(initial.relocated(Location::Device)),
            live_role: Role::Actor,
            snapshots: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The role whose weights the live model currently holds.
    pub fn live_role(&self) -> Role {
        self.live_role
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.snapshots.contains_key(&role)
    }

    pub fn snapshot(&self, role: Role) -> Option<&WeightSnapshot> {
        self.snapshots.get(&role)
    }

    pub fn is_resident(&self) -> bool {
        self.live.is_some()
    }

    /// The live model's weights.
    ///
    /// # Returns
    /// The weights or `NotResident` if the live model was released.
    pub fn live(&self) -> Result<&ParameterSet> {
        self.live.as_ref().ok_or_else(not_resident)
    }

    pub fn live_mut(&mut self) -> Result<&mut ParameterSet> {
        self.live.as_mut().ok_or_else(not_resident)
    }

    /// The live model's weights, checking they belong to `role`.
    pub fn live_as(&self, role: Role) -> Result<&ParameterSet> {
        if self.live_role != role {
            return Err(ActorErr::LiveRoleMismatch {
                expected: role,
                found: self.live_role,
            });
        }

        self.live()
    }

    /// The actor's current weights, wherever they live.
    ///
    /// # Returns
    /// The live model when it holds the actor, otherwise the actor's host
    /// snapshot, or `RoleNotFound` if neither exists.
    pub fn actor_weights(&self) -> Result<&ParameterSet> {
        match &self.live {
            Some(live) if self.live_role == Role::Actor => Ok(live),
            _ => self.snapshots.get(&Role::Actor).ok_or(ActorErr::RoleNotFound {
                role: Role::Actor,
            }),
        }
    }

    /// Copies the actor's current weights into the host snapshot of `role`.
    ///
    /// Works whether or not the live model is resident.
    pub fn snapshot_actor_as(&mut self, role: Role) -> Result<()> {
        let actor = self.actor_weights()?.relocated(Location::Host);
        debug!(role = role.key(), version = actor.version(); "actor weights snapshot to host");
        self.snapshots.insert(role, actor);
        Ok(())
    }

    /// Copies the live model into the host snapshot of `role`.
    ///
    /// The snapshot's buffers are reused when present. All copies complete
    /// before this returns.
    ///
    /// # Arguments
    /// * `role` - The slot to write.
    ///
    /// # Returns
    /// The written snapshot or `NotResident` if the live model was released.
    pub fn snapshot_to_host(&mut self, role: Role) -> Result<&WeightSnapshot> {
        let live = self.live.as_ref().ok_or_else(not_resident)?;

        let snapshot = match self.snapshots.remove(&role) {
            Some(mut snapshot) => {
                snapshot.copy_from(live)?;
                snapshot
            }
            None => live.relocated(Location::Host),
        };

        debug!(role = role.key(), version = snapshot.version(); "weights snapshot to host");
        Ok(&*self.snapshots.entry(role).or_insert(snapshot))
    }

    /// Copies the host snapshot of `role` into the live model.
    ///
    /// # Arguments
    /// * `role` - The slot to read.
    ///
    /// # Returns
    /// `RoleNotFound` if no snapshot of `role` exists, `NotResident` if the live model was released.
    pub fn restore_from_host(&mut self, role: Role) -> Result<()> {
        let snapshot = self
            .snapshots
            .get(&role)
            .ok_or(ActorErr::RoleNotFound { role })?;

        let live = self.live.as_mut().ok_or_else(not_resident)?;
        live.copy_from(snapshot)?;
        self.live_role = role;

        debug!(role = role.key(), version = live.version(); "weights restored from host");
        Ok(())
    }

    /// Makes the live model hold `role`, saving the actor's weights first when it's being swapped away.
    pub fn activate(&mut self, role: Role) -> Result<()> {
        if self.live_role == role {
            return Ok(());
        }

        if !self.has_role(role) {
            return Err(ActorErr::RoleNotFound { role });
        }

        if self.live_role == Role::Actor {
            self.snapshot_to_host(Role::Actor)?;
        }

        self.restore_from_host(role)
    }

    /// Overwrites the live model with externally loaded weights labelled as `role`.
    pub fn load_live(&mut self, params: &ParameterSet, role: Role) -> Result<()> {
        let live = self.live.as_mut().ok_or_else(not_resident)?;
        live.copy_from(params)?;
        self.live_role = role;
        Ok(())
    }

    /// Drops the live model's buffers.
    ///
    /// # Returns
    /// The amount of bytes released, zero if already released.
    pub fn release_device(&mut self) -> usize {
        match self.live.take() {
            Some(_) => self.schema.nbytes(),
            None => 0,
        }
    }

    /// Allocates fresh live buffers, their contents are meaningless until restored.
    pub fn reacquire_device(&mut self) {
        if self.live.is_none() {
            self.live = Some(ParameterSet::zeros(&self.schema, Location::Device));
        }
    }
}

fn not_resident() -> ActorErr {
    ActorErr::NotResident {
        tag: crate::memory::MODEL_TAG.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TensorDesc;

    fn store() -> ParameterStore {
        let schema = Schema::new(vec![
            TensorDesc::new("w", vec![2, 2]),
            TensorDesc::new("b", vec![2]),
        ])
        .unwrap();
        let initial =
            ParameterSet::from_tensors(&schema, Location::Host, vec![vec![0.5; 4], vec![-1.; 2]])
                .unwrap();
        ParameterStore::new(initial)
    }

    #[test]
    fn snapshot_then_restore_round_trips() {
        let mut store = store();
        let before = store.live().unwrap().clone();

        store.snapshot_to_host(Role::Actor).unwrap();
        store.live_mut().unwrap().fill(9.);
        store.restore_from_host(Role::Actor).unwrap();

        assert_eq!(store.live().unwrap().tensor(0), before.tensor(0));
        assert_eq!(store.live().unwrap().tensor(1), before.tensor(1));
        assert_eq!(store.snapshot(Role::Actor).unwrap().location(), Location::Host);
    }

    #[test]
    fn restore_missing_role_fails() {
        let mut store = store();
        let err = store.restore_from_host(Role::Reference).unwrap_err();
        assert!(matches!(err, ActorErr::RoleNotFound { role: Role::Reference }));
        assert_eq!(store.live_role(), Role::Actor);
    }

    #[test]
    fn activate_preserves_trained_actor() {
        let mut store = store();
        store.snapshot_to_host(Role::Actor).unwrap();
        store.live_mut().unwrap().fill(3.);
        store.snapshot_to_host(Role::Reference).unwrap();

        // training moves the live actor past its snapshot
        store.restore_from_host(Role::Actor).unwrap();
        store.live_mut().unwrap().fill(4.);

        store.activate(Role::Reference).unwrap();
        assert_eq!(store.live().unwrap().tensor(1), &[3., 3.]);

        store.activate(Role::Actor).unwrap();
        assert_eq!(store.live().unwrap().tensor(1), &[4., 4.]);
    }

    #[test]
    fn released_model_is_not_resident() {
        let mut store = store();
        assert_eq!(store.release_device(), 24);
        assert_eq!(store.release_device(), 0);
        assert!(matches!(
            store.snapshot_to_host(Role::Actor),
            Err(ActorErr::NotResident { .. })
        ));

        store.reacquire_device();
        assert!(store.is_resident());
    }

    #[test]
    fn released_actor_is_read_from_its_snapshot() {
        let mut store = store();
        assert!(matches!(
            store.actor_weights(),
            Ok(live) if live.location() == Location::Device
        ));

        store.snapshot_to_host(Role::Actor).unwrap();
        store.release_device();

        let actor = store.actor_weights().unwrap();
        assert_eq!(actor.location(), Location::Host);
        assert_eq!(actor.tensor(1), &[-1., -1.]);

        store.snapshot_actor_as(Role::OldActor).unwrap();
        assert_eq!(store.snapshot(Role::OldActor).unwrap().tensor(0), &[0.5; 4]);
        assert!(!store.is_resident());
    }

    #[test]
    fn released_actor_without_snapshot_is_missing() {
        let mut store = store();
        store.release_device();
        assert!(matches!(
            store.actor_weights(),
            Err(ActorErr::RoleNotFound { role: Role::Actor })
        ));
    }
}

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{EngineHandle, EngineId, EngineLock, WeightVersion};
use crate::error::{ActorErr, Result};

/// The rollout engines a synchronizer pushes to, with the lock guarding them.
#[derive(Clone)]
pub(super) struct Connection {
    pub engines: Vec<EngineHandle>,
    pub lock: EngineLock,
}

/// What every engine last acknowledged.
#[derive(Debug, Default)]
pub(super) struct SyncBook {
    /// The last version handed out, committed or not.
    pub issued: WeightVersion,
    pub acked: BTreeMap<EngineId, WeightVersion>,
}

impl SyncBook {
    pub fn next_version(&mut self) -> WeightVersion {
        self.issued += 1;
        self.issued
    }

    pub fn commit(&mut self, engines: &[EngineHandle], version: WeightVersion) {
        for engine in engines {
            self.acked.insert(engine.id(), version);
        }
    }
}

/// Connection state shared by every synchronization strategy.
///
/// The book's async mutex doubles as the push gate, holding it for a whole
/// push keeps pushes from overlapping.
#[derive(Default)]
pub(super) struct EngineRegistry {
    connection: Mutex<Option<Connection>>,
    pub book: tokio::sync::Mutex<SyncBook>,
}

impl EngineRegistry {
    pub fn connect(&self, engines: Vec<EngineHandle>, lock: EngineLock) -> Result<()> {
        let mut connection = self.connection.lock();
        if let Some(existing) = connection.as_ref() {
            return Err(ActorErr::AlreadyConnected {
                engines: existing.engines.len(),
            });
        }

        *connection = Some(Connection { engines, lock });
        Ok(())
    }

    pub fn disconnect(&self) -> Option<Vec<EngineHandle>> {
        self.connection.lock().take().map(|c| c.engines)
    }

    pub fn connection(&self) -> Result<Connection> {
        self.connection.lock().clone().ok_or(ActorErr::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }
}

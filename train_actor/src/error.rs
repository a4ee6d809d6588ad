use std::{error::Error, fmt, io, path::PathBuf};

use crate::{RolloutId, orchestrator::TrainingState, params::Role, sync::EngineId};

/// The actor module's result type.
pub type Result<T> = std::result::Result<T, ActorErr>;

/// Failures raised by the actor and its weight-synchronization machinery.
#[derive(Debug)]
pub enum ActorErr {
    RoleNotFound {
        role: Role,
    },
    UnsupportedOperation {
        op: &'static str,
        reason: &'static str,
    },
    AlreadyConnected {
        engines: usize,
    },
    NotConnected,
    PartialSync {
        version: u64,
        unreachable: Vec<EngineId>,
    },
    NumericalDivergence {
        param: String,
    },
    CheckpointIo {
        path: PathBuf,
        source: io::Error,
    },
    StateConflict {
        op: &'static str,
        state: TrainingState,
    },
    NotResident {
        tag: String,
    },
    OutOfDeviceMemory {
        tag: String,
        requested: usize,
        available: usize,
    },
    LiveRoleMismatch {
        expected: Role,
        found: Role,
    },
    SchemaMismatch {
        name: String,
        detail: String,
    },
    InvalidSample {
        index: usize,
        detail: String,
    },
    OutOfOrder {
        rollout_id: RolloutId,
        last: RolloutId,
    },
    CollectiveTimeout {
        op: &'static str,
        rank: usize,
    },
    Gateway(String),
    InvalidConfig(String),
    Io(io::Error),
    Rollout {
        rollout_id: RolloutId,
        state: TrainingState,
        source: Box<ActorErr>,
    },
}

impl ActorErr {
    /// Whether the outer loop must stop after seeing this error.
    ///
    /// Recoverable errors leave the actor consistent, the caller may retry or skip.
    ///
    /// # Returns
    /// `true` if the training run cannot continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            ActorErr::RoleNotFound { .. }
            | ActorErr::NotConnected
            | ActorErr::StateConflict { .. }
            | ActorErr::NotResident { .. }
            | ActorErr::OutOfOrder { .. } => false,
            ActorErr::Rollout { source, .. } => source.is_fatal(),
            _ => true,
        }
    }

    pub(crate) fn checkpoint(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn schema(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            name: name.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ActorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorErr::RoleNotFound { role } => write!(f, "no host snapshot for role {role}"),
            ActorErr::UnsupportedOperation { op, reason } => {
                write!(f, "{op} is not supported: {reason}")
            }
            ActorErr::AlreadyConnected { engines } => {
                write!(f, "already connected to {engines} rollout engines")
            }
            ActorErr::NotConnected => f.write_str("no rollout engines connected"),
            ActorErr::PartialSync {
                version,
                unreachable,
            } => write!(
                f,
                "weight version {version} was not committed, engines {unreachable:?} did not acknowledge"
            ),
            ActorErr::NumericalDivergence { param } => {
                write!(f, "non-finite values in parameter {param}")
            }
            ActorErr::CheckpointIo { path, source } => {
                write!(f, "checkpoint io error at {}: {source}", path.display())
            }
            ActorErr::StateConflict { op, state } => {
                write!(f, "{op} is not allowed while {state}")
            }
            ActorErr::NotResident { tag } => write!(f, "memory tagged {tag} is offloaded"),
            ActorErr::OutOfDeviceMemory {
                tag,
                requested,
                available,
            } => write!(
                f,
                "out of device memory for {tag}: requested {requested} bytes, {available} available"
            ),
            ActorErr::LiveRoleMismatch { expected, found } => {
                write!(f, "live model holds {found}, expected {expected}")
            }
            ActorErr::SchemaMismatch { name, detail } => {
                write!(f, "schema mismatch for {name}: {detail}")
            }
            ActorErr::InvalidSample { index, detail } => {
                write!(f, "invalid sample {index}: {detail}")
            }
            ActorErr::OutOfOrder { rollout_id, last } => write!(
                f,
                "rollout {rollout_id} arrived after rollout {last} was already trained"
            ),
            ActorErr::CollectiveTimeout { op, rank } => {
                write!(f, "collective {op} timed out on rank {rank}")
            }
            ActorErr::Gateway(e) => write!(f, "rollout data gateway error: {e}"),
            ActorErr::InvalidConfig(e) => write!(f, "invalid config: {e}"),
            ActorErr::Io(e) => write!(f, "io error: {e}"),
            ActorErr::Rollout {
                rollout_id,
                state,
                source,
            } => write!(f, "rollout {rollout_id} failed while {state}: {source}"),
        }
    }
}

impl Error for ActorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ActorErr::Io(e) | ActorErr::CheckpointIo { source: e, .. } => Some(e),
            ActorErr::Rollout { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for ActorErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<ActorErr> for io::Error {
    fn from(value: ActorErr) -> Self {
        match value {
            ActorErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_wrapper_inherits_fatality() {
        let recoverable = ActorErr::Rollout {
            rollout_id: 3,
            state: TrainingState::Training,
            source: Box::new(ActorErr::RoleNotFound { role: Role::Reference }),
        };
        assert!(!recoverable.is_fatal());

        let fatal = ActorErr::Rollout {
            rollout_id: 3,
            state: TrainingState::Training,
            source: Box::new(ActorErr::NumericalDivergence {
                param: "logits".into(),
            }),
        };
        assert!(fatal.is_fatal());
        assert!(fatal.to_string().contains("rollout 3"));
    }

    #[test]
    fn misuse_and_partial_pushes_are_fatal() {
        let partial = ActorErr::PartialSync {
            version: 2,
            unreachable: vec![2],
        };
        assert!(partial.is_fatal());
        assert!(ActorErr::AlreadyConnected { engines: 3 }.is_fatal());
        assert!(
            ActorErr::UnsupportedOperation {
                op: "offload",
                reason: "offloading is disabled",
            }
            .is_fatal()
        );
    }

    #[test]
    fn io_boundary_keeps_io_errors() {
        let err: io::Error = ActorErr::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = ActorErr::NotConnected.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

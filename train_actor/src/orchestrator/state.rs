use std::fmt;

use crate::params::Role;

/// The phase of a training step the actor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingState {
    #[default]
    Waiting,
    Preprocessing,
    ComputingLogProbs(Role),
    ComputingAdvantages,
    Training,
    Logging,
    Checkpointing,
}

impl TrainingState {
    /// Whether device memory may transition while in this state.
    pub fn allows_memory_transition(self) -> bool {
        matches!(self, TrainingState::Waiting | TrainingState::Preprocessing)
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingState::Waiting => f.write_str("waiting"),
            TrainingState::Preprocessing => f.write_str("preprocessing"),
            TrainingState::ComputingLogProbs(role) => write!(f, "computing {role} log probs"),
            TrainingState::ComputingAdvantages => f.write_str("computing advantages"),
            TrainingState::Training => f.write_str("training"),
            TrainingState::Logging => f.write_str("logging"),
            TrainingState::Checkpointing => f.write_str("checkpointing"),
        }
    }
}

/// Tracks the current state and the ones visited during the last step.
#[derive(Debug, Default)]
pub(super) struct StateMachine {
    current: TrainingState,
    trace: Vec<TrainingState>,
}

impl StateMachine {
    pub fn current(&self) -> TrainingState {
        self.current
    }

    pub fn trace(&self) -> &[TrainingState] {
        &self.trace
    }

    /// Starts tracing a new step.
    pub fn begin(&mut self) {
        self.trace.clear();
        self.enter(TrainingState::Preprocessing);
    }

    pub fn enter(&mut self, next: TrainingState) {
        log::trace!("state transition {} -> {next}", self.current);
        self.current = next;
        self.trace.push(next);
    }

    /// Returns to `Waiting`, yielding the state the step was left in.
    pub fn finish(&mut self) -> TrainingState {
        let last = self.current;
        self.current = TrainingState::Waiting;
        self.trace.push(TrainingState::Waiting);
        last
    }
}

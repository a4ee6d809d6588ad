mod actor;
mod builder;
mod state;
mod step;

pub use actor::{PostprocessHook, TrainingStepOrchestrator};
pub use builder::OrchestratorBuilder;
pub use state::TrainingState;
pub use step::TrainReport;

use state::StateMachine;

pub(crate) const TRAIN_WAIT: &str = "train_wait";

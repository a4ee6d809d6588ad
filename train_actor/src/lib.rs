pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod params;
pub mod rollout;
pub mod sync;
pub mod training;

pub use config::ActorConfig;
pub use error::{ActorErr, Result};
pub use orchestrator::{OrchestratorBuilder, TrainReport, TrainingState, TrainingStepOrchestrator};

/// Identifies one generate-then-train iteration of the loop, never reused.
pub type RolloutId = u64;

mod batch;
mod data;
mod microbatch;
mod trajectory;

pub use batch::{DataRef, Episode, Reply, RolloutBatch, Sample};
pub use data::{ADVANTAGES, LOG_PROBS, RETURNS, RolloutData, log_probs_key};
pub use microbatch::{DataIterators, MicrobatchIter, MicrobatchPolicy};
pub use trajectory::{
    DecodeErr, DecodeFailurePolicy, Step, StepOutcome, Trajectory, TrajectoryBuilder,
};

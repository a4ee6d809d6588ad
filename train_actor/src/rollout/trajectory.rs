use std::{error::Error, fmt};

use log::warn;
use serde::{Deserialize, Serialize};

/// A reply the rollout side couldn't decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeErr(pub String);

impl fmt::Display for DecodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undecodable reply: {}", self.0)
    }
}

impl Error for DecodeErr {}

/// What a multi-turn trajectory does with a reply that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Record an empty reply in its place and end the turn.
    #[default]
    SubstituteEmpty,
    /// Drop the reply and end the turn.
    EndTurn,
    /// Drop the reply and end the whole trajectory.
    EndTrajectory,
}

/// One decoded assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub tokens: Vec<u32>,
    /// Whether the reply asks for a tool call, which keeps the turn going.
    pub is_call: bool,
}

/// Where the trajectory stands after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    TurnEnded,
    TrajectoryEnded,
}

/// The replies of a multi-turn episode grouped by turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub turns: Vec<Vec<Vec<u32>>>,
    pub decode_failures: usize,
    /// Whether a decode failure cut the trajectory short.
    pub aborted: bool,
}

impl Trajectory {
    /// The amount of tokens across every reply.
    pub fn response_len(&self) -> usize {
        self.turns.iter().flatten().map(Vec::len).sum()
    }

    /// Every reply's tokens in order.
    pub fn response_tokens(&self) -> Vec<u32> {
        self.turns.iter().flatten().flatten().copied().collect()
    }
}

/// Assembles a `Trajectory` one reply at a time.
///
/// A turn ends when a reply isn't a tool call or after `max_steps_per_turn`
/// replies, the trajectory ends after `max_turns` turns.
#[derive(Debug)]
pub struct TrajectoryBuilder {
    policy: DecodeFailurePolicy,
    max_turns: usize,
    max_steps_per_turn: usize,
    current: Vec<Vec<u32>>,
    trajectory: Trajectory,
    done: bool,
}

impl TrajectoryBuilder {
    pub fn new(policy: DecodeFailurePolicy, max_turns: usize, max_steps_per_turn: usize) -> Self {
        Self {
            policy,
            max_turns,
            max_steps_per_turn,
            current: Vec::new(),
            trajectory: Trajectory::default(),
            done: max_turns == 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Records the next reply of the current turn.
    ///
    /// # Arguments
    /// * `step` - The decoded reply or the decoding failure.
    ///
    /// # Returns
    /// Whether the caller should keep sampling, start a new turn or stop.
    pub fn push_step(&mut self, step: Result<Step, DecodeErr>) -> StepOutcome {
        if self.done {
            return StepOutcome::TrajectoryEnded;
        }

        match step {
            Ok(Step { tokens, is_call }) => {
                self.current.push(tokens);
                if is_call && self.current.len() < self.max_steps_per_turn {
                    return StepOutcome::Continue;
                }
            }
            Err(e) => {
                self.trajectory.decode_failures += 1;
                warn!("{e}, applying {:?}", self.policy);

                match self.policy {
                    DecodeFailurePolicy::SubstituteEmpty => self.current.push(Vec::new()),
                    DecodeFailurePolicy::EndTurn => {}
                    DecodeFailurePolicy::EndTrajectory => {
                        self.trajectory.aborted = true;
                        self.done = true;
                    }
                }
            }
        }

        self.end_turn()
    }

    fn end_turn(&mut self) -> StepOutcome {
        self.trajectory.turns.push(std::mem::take(&mut self.current));
        if self.trajectory.turns.len() >= self.max_turns {
            self.done = true;
        }

        match self.done {
            true => StepOutcome::TrajectoryEnded,
            false => StepOutcome::TurnEnded,
        }
    }

    pub fn finish(mut self) -> Trajectory {
        if !self.current.is_empty() {
            self.trajectory.turns.push(self.current);
        }

        self.trajectory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(tokens: &[u32]) -> Result<Step, DecodeErr> {
        Ok(Step {
            tokens: tokens.to_vec(),
            is_call: true,
        })
    }

    fn answer(tokens: &[u32]) -> Result<Step, DecodeErr> {
        Ok(Step {
            tokens: tokens.to_vec(),
            is_call: false,
        })
    }

    fn garbage() -> Result<Step, DecodeErr> {
        Err(DecodeErr("<|bad".into()))
    }

    #[test]
    fn turns_end_on_plain_replies_and_step_limit() {
        let mut builder = TrajectoryBuilder::new(DecodeFailurePolicy::default(), 2, 2);

        assert_eq!(builder.push_step(call(&[1])), StepOutcome::Continue);
        assert_eq!(builder.push_step(call(&[2, 3])), StepOutcome::TurnEnded);
        assert_eq!(builder.push_step(answer(&[4])), StepOutcome::TrajectoryEnded);

        let trajectory = builder.finish();
        assert_eq!(trajectory.turns, vec![vec![vec![1], vec![2, 3]], vec![vec![4]]]);
        assert_eq!(trajectory.response_len(), 4);
        assert_eq!(trajectory.response_tokens(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn substitute_empty_keeps_a_placeholder() {
        let mut builder = TrajectoryBuilder::new(DecodeFailurePolicy::SubstituteEmpty, 2, 4);
        builder.push_step(call(&[1]));
        assert_eq!(builder.push_step(garbage()), StepOutcome::TurnEnded);

        let trajectory = builder.finish();
        assert_eq!(trajectory.turns, vec![vec![vec![1], vec![]]]);
        assert_eq!(trajectory.decode_failures, 1);
    }

    #[test]
    fn end_turn_drops_the_reply() {
        let mut builder = TrajectoryBuilder::new(DecodeFailurePolicy::EndTurn, 2, 4);
        builder.push_step(call(&[1]));
        assert_eq!(builder.push_step(garbage()), StepOutcome::TurnEnded);
        assert_eq!(builder.finish().turns, vec![vec![vec![1]]]);
    }

    #[test]
    fn end_trajectory_stops_everything() {
        let mut builder = TrajectoryBuilder::new(DecodeFailurePolicy::EndTrajectory, 3, 4);
        assert_eq!(builder.push_step(garbage()), StepOutcome::TrajectoryEnded);
        assert!(builder.is_done());
        assert_eq!(builder.push_step(call(&[9])), StepOutcome::TrajectoryEnded);

        let trajectory = builder.finish();
        assert!(trajectory.aborted);
        assert_eq!(trajectory.turns, vec![Vec::<Vec<u32>>::new()]);
    }
}

use serde::{Deserialize, Serialize};

use super::trajectory::{DecodeErr, DecodeFailurePolicy, Step, StepOutcome, TrajectoryBuilder};

/// Opaque handle to a batch of rollout results held by the data gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef(pub String);

impl From<&str> for DataRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One generated response along with its prompt and reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: usize,
    /// Samples generated from the same prompt share a group.
    pub group_index: usize,
    pub prompt_tokens: Vec<u32>,
    pub response_tokens: Vec<u32>,
    /// Per response token, zero excludes the token from the loss.
    #[serde(default)]
    pub loss_mask: Option<Vec<u8>>,
    pub reward: f32,
    #[serde(default)]
    pub truncated: bool,
    /// Log-probabilities the rollout engine computed while sampling.
    #[serde(default)]
    pub rollout_log_probs: Option<Vec<f32>>,
}

impl Sample {
    pub fn response_len(&self) -> usize {
        self.response_tokens.len()
    }

    pub fn total_len(&self) -> usize {
        self.prompt_tokens.len() + self.response_tokens.len()
    }

    /// The loss weight of every response token.
    pub fn mask(&self) -> Vec<f32> {
        match &self.loss_mask {
            Some(mask) => mask.iter().map(|&m| if m == 0 { 0. } else { 1. }).collect(),
            None => vec![1.; self.response_len()],
        }
    }
}

/// One raw assistant reply of a multi-turn episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub tokens: Vec<u32>,
    /// Set when the rollout side couldn't decode the reply, `tokens` is ignored then.
    #[serde(default)]
    pub decode_error: Option<String>,
    #[serde(default)]
    pub is_call: bool,
}

/// A multi-turn episode whose replies still have to be joined into a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub index: usize,
    pub group_index: usize,
    pub prompt_tokens: Vec<u32>,
    pub replies: Vec<Reply>,
    pub reward: f32,
    #[serde(default)]
    pub truncated: bool,
}

impl Episode {
    /// Joins the replies into a single sample.
    ///
    /// # Arguments
    /// * `policy` - What to do with replies that failed to decode.
    ///
    /// # Returns
    /// The sample, truncated when a decode failure ended the episode early.
    pub fn assemble(self, policy: DecodeFailurePolicy) -> Sample {
        let mut builder = TrajectoryBuilder::new(policy, usize::MAX, usize::MAX);
        for reply in self.replies {
            let step = match reply.decode_error {
                Some(e) => Err(DecodeErr(e)),
                None => Ok(Step {
                    tokens: reply.tokens,
                    is_call: reply.is_call,
                }),
            };

            if builder.push_step(step) == StepOutcome::TrajectoryEnded {
                break;
            }
        }

        let trajectory = builder.finish();
        Sample {
            index: self.index,
            group_index: self.group_index,
            prompt_tokens: self.prompt_tokens,
            response_tokens: trajectory.response_tokens(),
            loss_mask: None,
            reward: self.reward,
            truncated: self.truncated || trajectory.aborted,
            rollout_log_probs: None,
        }
    }
}

/// The samples of one rollout, as fetched from the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutBatch {
    pub samples: Vec<Sample>,
    /// Multi-turn episodes, joined into `samples` before training.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episodes: Vec<Episode>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RolloutBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Turns every pending episode into a sample, keeping the batch ordered by index.
    pub fn assemble_episodes(&mut self, policy: DecodeFailurePolicy) {
        if self.episodes.is_empty() {
            return;
        }

        let episodes = std::mem::take(&mut self.episodes);
        self.samples
            .extend(episodes.into_iter().map(|e| e.assemble(policy)));
        self.samples.sort_by_key(|s| s.index);
    }

    /// The positions of the samples a data-parallel rank trains on.
    ///
    /// Samples are dealt round-robin so every rank sees a share of every group.
    pub fn partition(&self, rank: usize, world_size: usize) -> Vec<usize> {
        (rank..self.samples.len()).step_by(world_size.max(1)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(index: usize) -> Sample {
        Sample {
            index,
            group_index: index / 2,
            prompt_tokens: vec![1],
            response_tokens: vec![2, 3],
            loss_mask: None,
            reward: 0.,
            truncated: false,
            rollout_log_probs: None,
        }
    }

    #[test]
    fn partitions_cover_every_sample_once() {
        let batch = RolloutBatch {
            samples: (0..7).map(sample).collect(),
            ..Default::default()
        };

        let mut seen: Vec<usize> = (0..3).flat_map(|rank| batch.partition(rank, 3)).collect();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(batch.partition(2, 3), vec![2, 5]);
    }

    #[test]
    fn missing_mask_weighs_every_token() {
        let mut s = sample(0);
        assert_eq!(s.mask(), vec![1., 1.]);

        s.loss_mask = Some(vec![1, 0]);
        assert_eq!(s.mask(), vec![1., 0.]);
    }

    fn episode(replies: Vec<Reply>) -> Episode {
        Episode {
            index: 1,
            group_index: 0,
            prompt_tokens: vec![1],
            replies,
            reward: 1.,
            truncated: false,
        }
    }

    fn reply(tokens: &[u32], is_call: bool) -> Reply {
        Reply {
            tokens: tokens.to_vec(),
            decode_error: None,
            is_call,
        }
    }

    fn undecodable() -> Reply {
        Reply {
            tokens: vec![7, 7],
            decode_error: Some("unterminated tool call".into()),
            is_call: false,
        }
    }

    #[test]
    fn episodes_join_every_turn() {
        let mut batch = RolloutBatch {
            samples: vec![sample(0), sample(2)],
            episodes: vec![episode(vec![reply(&[3], true), reply(&[4, 5], false), reply(&[6], false)])],
            ..Default::default()
        };
        batch.assemble_episodes(DecodeFailurePolicy::default());

        assert!(batch.episodes.is_empty());
        assert_eq!(batch.samples.iter().map(|s| s.index).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(batch.samples[1].response_tokens, vec![3, 4, 5, 6]);
        assert!(!batch.samples[1].truncated);
    }

    #[test]
    fn decode_failures_follow_the_policy() {
        let replies = vec![reply(&[3], true), undecodable(), reply(&[6], false)];

        let empty = episode(replies.clone()).assemble(DecodeFailurePolicy::SubstituteEmpty);
        assert_eq!(empty.response_tokens, vec![3, 6]);
        assert!(!empty.truncated);

        let ended = episode(replies).assemble(DecodeFailurePolicy::EndTrajectory);
        assert_eq!(ended.response_tokens, vec![3]);
        assert!(ended.truncated);
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"samples":[{"index":0,"group_index":0,"prompt_tokens":[1],"response_tokens":[2],"reward":1.0}]}"#;
        let batch: RolloutBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.samples[0].loss_mask, None);
        assert!(!batch.samples[0].truncated);
    }
}

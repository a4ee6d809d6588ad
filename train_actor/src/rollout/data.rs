use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{RolloutBatch, Sample};
use crate::{
    RolloutId,
    error::{ActorErr, Result},
    params::Role,
};

pub const LOG_PROBS: &str = "log_probs";
pub const ADVANTAGES: &str = "advantages";
pub const RETURNS: &str = "returns";

/// The per-token key under which `role`'s log-probabilities are stored.
pub fn log_probs_key(role: Role) -> String {
    format!("{}{LOG_PROBS}", role.log_prob_prefix())
}

/// The share of a rollout one data-parallel rank trains on, along with
/// every per-token quantity derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutData {
    pub rollout_id: RolloutId,
    pub rank: usize,
    pub samples: Vec<Sample>,
    /// Position of each local sample in the full batch.
    pub positions: Vec<usize>,
    /// Reward of every sample of the full batch.
    pub global_rewards: Vec<f32>,
    /// Group of every sample of the full batch.
    pub global_groups: Vec<usize>,
    pub per_token: BTreeMap<String, Vec<Vec<f32>>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RolloutData {
    /// Keeps the share of `batch` that belongs to `rank`.
    ///
    /// # Arguments
    /// * `rollout_id` - The rollout the batch was generated in.
    /// * `batch` - The full batch fetched from the gateway.
    /// * `rank` - This data-parallel rank.
    /// * `world_size` - The amount of data-parallel ranks.
    ///
    /// # Returns
    /// The rank's rollout data, without any per-token quantity yet.
    pub fn new(rollout_id: RolloutId, batch: RolloutBatch, rank: usize, world_size: usize) -> Self {
        let positions = batch.partition(rank, world_size);
        let global_rewards = batch.samples.iter().map(|s| s.reward).collect();
        let global_groups = batch.samples.iter().map(|s| s.group_index).collect();

        let mut all: Vec<Option<Sample>> = batch.samples.into_iter().map(Some).collect();
        let samples = positions.iter().filter_map(|&p| all[p].take()).collect();

        Self {
            rollout_id,
            rank,
            samples,
            positions,
            global_rewards,
            global_groups,
            per_token: BTreeMap::new(),
            metadata: batch.metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The amount of samples in the full batch, across every rank.
    pub fn global_len(&self) -> usize {
        self.global_rewards.len()
    }

    /// The amount of response tokens across the local samples.
    pub fn response_tokens(&self) -> usize {
        self.samples.iter().map(Sample::response_len).sum()
    }

    pub fn get(&self, key: &str) -> Option<&[Vec<f32>]> {
        self.per_token.get(key).map(Vec::as_slice)
    }

    /// Stores a per-token quantity.
    ///
    /// # Arguments
    /// * `key` - The quantity's name.
    /// * `values` - One vector per local sample, one value per response token.
    ///
    /// # Returns
    /// `InvalidSample` if `values` doesn't line up with the samples.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<Vec<f32>>) -> Result<()> {
        let key = key.into();
        if values.len() != self.samples.len() {
            return Err(ActorErr::InvalidSample {
                index: values.len().min(self.samples.len()),
                detail: format!("{key} has {} rows for {} samples", values.len(), self.samples.len()),
            });
        }

        for (sample, row) in self.samples.iter().zip(&values) {
            if row.len() != sample.response_len() {
                return Err(ActorErr::InvalidSample {
                    index: sample.index,
                    detail: format!(
                        "{key} has {} values for {} response tokens",
                        row.len(),
                        sample.response_len()
                    ),
                });
            }
        }

        self.per_token.insert(key, values);
        Ok(())
    }
}

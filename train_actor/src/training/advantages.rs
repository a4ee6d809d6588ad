use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::rollout::RolloutData;

/// Turns sample rewards into per-token advantages and returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvantageEstimator {
    /// Group-relative advantages, every sample is compared against the
    /// other samples generated from the same prompt.
    Grpo {
        #[serde(default = "default_true")]
        normalize_std: bool,
    },
    /// The reward minus a fixed baseline.
    ValueBaseline {
        #[serde(default)]
        baseline: f32,
    },
}

fn default_true() -> bool {
    true
}

impl Default for AdvantageEstimator {
    fn default() -> Self {
        Self::Grpo {
            normalize_std: true,
        }
    }
}

const STD_EPSILON: f32 = 1e-6;

impl AdvantageEstimator {
    /// Computes the advantages and returns of every local sample.
    ///
    /// Group statistics are taken over the full batch, so the result doesn't
    /// depend on how samples were dealt across ranks.
    ///
    /// # Arguments
    /// * `data` - The rank's rollout data.
    ///
    /// # Returns
    /// The per-token advantages and returns, in local sample order.
    pub fn compute(&self, data: &RolloutData) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let sample_advantages: Vec<f32> = match *self {
            AdvantageEstimator::Grpo { normalize_std } => {
                let stats = group_stats(&data.global_rewards, &data.global_groups);
                data.positions
                    .iter()
                    .map(|&pos| {
                        let (mean, std) = stats[&data.global_groups[pos]];
                        let centered = data.global_rewards[pos] - mean;
                        match normalize_std {
                            true => centered / (std + STD_EPSILON),
                            false => centered,
                        }
                    })
                    .collect()
            }
            AdvantageEstimator::ValueBaseline { baseline } => {
                data.samples.iter().map(|s| s.reward - baseline).collect()
            }
        };

        let advantages: Vec<Vec<f32>> = data
            .samples
            .iter()
            .zip(&sample_advantages)
            .map(|(sample, &adv)| vec![adv; sample.response_len()])
            .collect();

        let returns = match self {
            AdvantageEstimator::Grpo { .. } => advantages.clone(),
            AdvantageEstimator::ValueBaseline { .. } => data
                .samples
                .iter()
                .map(|s| vec![s.reward; s.response_len()])
                .collect(),
        };

        (advantages, returns)
    }
}

/// Mean and population standard deviation of the rewards of every group.
fn group_stats(rewards: &[f32], groups: &[usize]) -> HashMap<usize, (f32, f32)> {
    let mut members: HashMap<usize, Vec<f32>> = HashMap::new();
    for (&group, &reward) in groups.iter().zip(rewards) {
        members.entry(group).or_default().push(reward);
    }

    members
        .into_iter()
        .map(|(group, rewards)| {
            let n = rewards.len() as f32;
            let mean = rewards.iter().sum::<f32>() / n;
            let var = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / n;
            (group, (mean, var.sqrt()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::{RolloutBatch, Sample};

    fn batch(rewards: &[(usize, f32)]) -> RolloutBatch {
        RolloutBatch {
            samples: rewards
                .iter()
                .enumerate()
                .map(|(i, &(group_index, reward))| Sample {
                    index: i,
                    group_index,
                    prompt_tokens: vec![0],
                    response_tokens: vec![1, 2],
                    loss_mask: None,
                    reward,
                    truncated: false,
                    rollout_log_probs: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn grpo_centers_within_groups() {
        let data = RolloutData::new(0, batch(&[(0, 1.), (0, 0.), (1, 5.), (1, 5.)]), 0, 1);
        let estimator = AdvantageEstimator::Grpo {
            normalize_std: false,
        };

        let (adv, ret) = estimator.compute(&data);
        assert_eq!(adv[0], vec![0.5, 0.5]);
        assert_eq!(adv[1], vec![-0.5, -0.5]);
        assert_eq!(adv[2], vec![0., 0.]);
        assert_eq!(adv, ret);
    }

    #[test]
    fn grpo_ignores_rank_partitioning() {
        let batch = batch(&[(0, 1.), (0, 0.), (0, 1.), (0, 0.)]);
        let estimator = AdvantageEstimator::default();

        let whole = RolloutData::new(0, batch.clone(), 0, 1);
        let (whole_adv, _) = estimator.compute(&whole);

        let shard = RolloutData::new(0, batch, 1, 2);
        let (shard_adv, _) = estimator.compute(&shard);

        assert_eq!(shard_adv[0], whole_adv[1]);
        assert_eq!(shard_adv[1], whole_adv[3]);
        assert!((whole_adv[0][0] - 1.).abs() < 1e-4);
    }

    #[test]
    fn baseline_subtracts_from_reward() {
        let data = RolloutData::new(0, batch(&[(0, 1.), (1, 1.)]), 0, 1);
        let estimator = AdvantageEstimator::ValueBaseline { baseline: 0.25 };

        let (adv, ret) = estimator.compute(&data);
        assert_eq!(adv[0], vec![0.75, 0.75]);
        assert_eq!(ret[1], vec![1., 1.]);
    }
}

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use super::{RolloutData, Sample};

/// How samples are grouped into the microbatches of a forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrobatchPolicy {
    /// A fixed amount of samples per microbatch.
    Fixed(NonZeroUsize),
    /// As many samples as fit in a token budget, a longer sample travels alone.
    MaxTokens(NonZeroUsize),
}

/// A resettable iterator over microbatches of local sample indices.
#[derive(Debug, Clone, Default)]
pub struct MicrobatchIter {
    batches: Vec<Vec<usize>>,
    cursor: usize,
}

impl MicrobatchIter {
    /// Groups `indices` into microbatches.
    ///
    /// # Arguments
    /// * `indices` - Indices into `samples`, in iteration order.
    /// * `samples` - The local samples.
    /// * `policy` - The grouping policy.
    ///
    /// # Returns
    /// A new `MicrobatchIter` positioned at the first microbatch.
    pub fn new(indices: &[usize], samples: &[Sample], policy: MicrobatchPolicy) -> Self {
        let batches = match policy {
            MicrobatchPolicy::Fixed(size) => indices.chunks(size.get()).map(<[usize]>::to_vec).collect(),
            MicrobatchPolicy::MaxTokens(budget) => {
                let mut batches = Vec::new();
                let mut current = Vec::new();
                let mut tokens = 0;

                for &i in indices {
                    let len = samples[i].total_len();
                    if !current.is_empty() && tokens + len > budget.get() {
                        batches.push(std::mem::take(&mut current));
                        tokens = 0;
                    }

                    tokens += len;
                    current.push(i);
                }

                if !current.is_empty() {
                    batches.push(current);
                }

                batches
            }
        };

        Self { batches, cursor: 0 }
    }

    pub fn num_microbatches(&self) -> usize {
        self.batches.len()
    }

    /// Rewinds to the first microbatch.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for MicrobatchIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.batches.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(batch)
    }
}

/// Every iterator a training step walks over.
#[derive(Debug, Clone)]
pub struct DataIterators {
    /// Over every local sample, for log-probability passes.
    pub log_probs: MicrobatchIter,
    /// One per optimizer step, over the local samples of that step.
    pub train_steps: Vec<MicrobatchIter>,
    /// The amount of samples each optimizer step covers across every rank.
    pub step_sizes: Vec<usize>,
}

impl DataIterators {
    /// Splits the rank's data into optimizer steps and microbatches.
    ///
    /// Steps are cut over the full batch so every rank runs the same amount of
    /// them, even when it holds no sample of a given step.
    pub fn new(
        data: &RolloutData,
        global_batch_size: NonZeroUsize,
        log_probs_policy: MicrobatchPolicy,
        train_policy: MicrobatchPolicy,
    ) -> Self {
        let all: Vec<usize> = (0..data.len()).collect();
        let log_probs = MicrobatchIter::new(&all, &data.samples, log_probs_policy);

        let gbs = global_batch_size.get();
        let global = data.global_len();
        let steps = global.div_ceil(gbs);

        let (train_steps, step_sizes): (Vec<_>, Vec<_>) = (0..steps)
            .map(|step| {
                let range = step * gbs..((step + 1) * gbs).min(global);
                let local: Vec<usize> = data
                    .positions
                    .iter()
                    .enumerate()
                    .filter(|&(_, &pos)| range.contains(&pos))
                    .map(|(i, _)| i)
                    .collect();

                let iter = MicrobatchIter::new(&local, &data.samples, train_policy);
                (iter, range.len())
            })
            .unzip();

        Self {
            log_probs,
            train_steps,
            step_sizes,
        }
    }
}

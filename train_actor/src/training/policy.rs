use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::{ActorErr, Result},
    params::{ParameterSet, TensorDesc},
    rollout::Sample,
};

/// A token-level policy the actor can train.
pub trait PolicyModel: Send + Sync {
    /// The tensors the model is made of.
    fn schema(&self) -> Vec<TensorDesc>;

    /// Initial values for every schema tensor, in schema order.
    fn init(&self, seed: u64) -> Vec<Vec<f32>>;

    /// The log-probability of every response token of `sample`.
    ///
    /// # Arguments
    /// * `params` - The weights to evaluate with.
    /// * `sample` - The prompt and response.
    ///
    /// # Returns
    /// One value per response token, or `InvalidSample` if a token is out of range.
    fn log_probs(&self, params: &ParameterSet, sample: &Sample) -> Result<Vec<f32>>;

    /// Accumulates `sum_t coeffs[t] * d logp_t / d params` into `grads`.
    ///
    /// # Arguments
    /// * `params` - The weights the log-probabilities were taken at.
    /// * `sample` - The prompt and response.
    /// * `coeffs` - One coefficient per response token.
    /// * `grads` - Where gradients are accumulated.
    fn backward(
        &self,
        params: &ParameterSet,
        sample: &Sample,
        coeffs: &[f32],
        grads: &mut ParameterSet,
    ) -> Result<()>;
}

const LOGITS: &str = "logits";

/// A softmax policy over the next token given only the previous one.
///
/// Its single tensor holds one row of logits per previous token.
#[derive(Debug, Clone)]
pub struct BigramPolicy {
    vocab: usize,
    init_scale: f32,
}

impl BigramPolicy {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            init_scale: 0.01,
        }
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    /// Walks `(previous, next)` token pairs of the response.
    fn pairs<'s>(&self, sample: &'s Sample) -> Result<impl Iterator<Item = (usize, usize)> + 's> {
        let tokens = sample.prompt_tokens.iter().chain(&sample.response_tokens);
        if let Some(&bad) = tokens.clone().find(|&&t| t as usize >= self.vocab) {
            return Err(ActorErr::InvalidSample {
                index: sample.index,
                detail: format!("token {bad} outside a vocabulary of {}", self.vocab),
            });
        }

        let first = sample.prompt_tokens.last().copied().unwrap_or(0) as usize;
        let prev = std::iter::once(first).chain(sample.response_tokens.iter().map(|&t| t as usize));
        let next = sample.response_tokens.iter().map(|&t| t as usize);
        Ok(prev.zip(next))
    }

    fn logits<'p>(&self, params: &'p ParameterSet) -> Result<ArrayView2<'p, f32>> {
        let values = params
            .get(LOGITS)
            .ok_or_else(|| ActorErr::schema(LOGITS, "missing tensor"))?;

        ArrayView2::from_shape((self.vocab, self.vocab), values)
            .map_err(|e| ActorErr::schema(LOGITS, e.to_string()))
    }
}

/// The log-softmax normalizer of a row of logits.
fn log_sum_exp(row: ArrayView1<'_, f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    max + row.mapv(|v| (v - max).exp()).sum().ln()
}

impl PolicyModel for BigramPolicy {
    fn schema(&self) -> Vec<TensorDesc> {
        vec![TensorDesc::new(LOGITS, vec![self.vocab, self.vocab])]
    }

    fn init(&self, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = self.init_scale;
        let logits = (0..self.vocab * self.vocab)
            .map(|_| rng.random_range(-scale..scale))
            .collect();

        vec![logits]
    }

    fn log_probs(&self, params: &ParameterSet, sample: &Sample) -> Result<Vec<f32>> {
        let logits = self.logits(params)?;

        Ok(self
            .pairs(sample)?
            .map(|(prev, next)| {
                let row = logits.index_axis(Axis(0), prev);
                row[next] - log_sum_exp(row)
            })
            .collect())
    }

    fn backward(
        &self,
        params: &ParameterSet,
        sample: &Sample,
        coeffs: &[f32],
        grads: &mut ParameterSet,
    ) -> Result<()> {
        let logits = self.logits(params)?;
        let i = grads
            .schema()
            .position(LOGITS)
            .ok_or_else(|| ActorErr::schema(LOGITS, "missing gradient"))?;
        let mut grad = ArrayViewMut2::from_shape((self.vocab, self.vocab), grads.tensor_mut(i))
            .map_err(|e| ActorErr::schema(LOGITS, e.to_string()))?;

        for ((prev, next), &c) in self.pairs(sample)?.zip(coeffs) {
            if c == 0. {
                continue;
            }

            // d logp(next | prev) / d logits[prev] = onehot(next) - softmax(logits[prev])
            let row = logits.index_axis(Axis(0), prev);
            let lse = log_sum_exp(row);
            let mut g = grad.index_axis_mut(Axis(0), prev);
            g.zip_mut_with(&row, |g, &l| *g -= c * (l - lse).exp());
            g[next] += c;
        }

        Ok(())
    }
}

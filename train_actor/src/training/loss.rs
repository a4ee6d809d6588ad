use serde::{Deserialize, Serialize};

/// PPO clipped surrogate settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub eps_clip: f32,
    /// Upper clip range, `eps_clip` when unset.
    pub eps_clip_high: Option<f32>,
    /// Weight of the KL penalty towards the reference policy.
    pub kl_coef: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            eps_clip: 0.2,
            eps_clip_high: None,
            kl_coef: 0.,
        }
    }
}

/// The loss of one sample and its derivative with respect to every token's log-probability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossTerms {
    /// `dL/dlogp` of every response token.
    pub coeffs: Vec<f32>,
    pub pg_loss: f32,
    pub kl: f32,
    /// The amount of tokens whose ratio got clipped.
    pub clipped: usize,
}

/// Computes the PPO clipped policy loss of one sample.
///
/// # Arguments
/// * `cfg` - The clipping and penalty settings.
/// * `log_probs` - The current policy's token log-probabilities.
/// * `old_log_probs` - The behavior policy's token log-probabilities.
/// * `ref_log_probs` - The reference policy's, when a KL penalty applies.
/// * `advantages` - The token advantages.
/// * `mask` - The token loss weights.
/// * `denom` - What the summed token losses are divided by.
///
/// # Returns
/// The loss terms of the sample.
pub fn policy_loss(
    cfg: &LossConfig,
    log_probs: &[f32],
    old_log_probs: &[f32],
    ref_log_probs: Option<&[f32]>,
    advantages: &[f32],
    mask: &[f32],
    denom: f32,
) -> LossTerms {
    let low = 1. - cfg.eps_clip;
    let high = 1. + cfg.eps_clip_high.unwrap_or(cfg.eps_clip);

    let mut terms = LossTerms {
        coeffs: Vec::with_capacity(log_probs.len()),
        ..Default::default()
    };

    for (t, (&logp, &old)) in log_probs.iter().zip(old_log_probs).enumerate() {
        let weight = mask[t] / denom;
        let adv = advantages[t];

        let ratio = (logp - old).exp();
        let unclipped = ratio * adv;
        let clipped = ratio.clamp(low, high) * adv;

        // the clipped branch is constant in logp
        let mut coeff = match unclipped <= clipped {
            true => -unclipped,
            false => {
                terms.clipped += (mask[t] > 0.) as usize;
                0.
            }
        };
        terms.pg_loss -= unclipped.min(clipped) * weight;

        if let Some(reference) = ref_log_probs {
            let kl = logp - reference[t];
            terms.kl += kl * weight;
            coeff += cfg.kl_coef;
        }

        terms.coeffs.push(coeff * weight);
    }

    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_policy_coefficients_are_minus_advantage() {
        let terms = policy_loss(
            &LossConfig::default(),
            &[-1., -2.],
            &[-1., -2.],
            None,
            &[1., -0.5],
            &[1., 1.],
            2.,
        );

        assert_eq!(terms.coeffs, vec![-0.5, 0.25]);
        assert!((terms.pg_loss - -0.25).abs() < 1e-6);
        assert_eq!(terms.clipped, 0);
    }

    #[test]
    fn clipped_tokens_have_no_gradient() {
        // ratio e^1 is well above 1.2 with a positive advantage
        let terms = policy_loss(
            &LossConfig::default(),
            &[0.],
            &[-1.],
            None,
            &[1.],
            &[1.],
            1.,
        );

        assert_eq!(terms.coeffs, vec![0.]);
        assert_eq!(terms.clipped, 1);
        assert!((terms.pg_loss - -1.2).abs() < 1e-6);
    }

    #[test]
    fn kl_penalty_and_mask() {
        let cfg = LossConfig {
            kl_coef: 0.1,
            ..Default::default()
        };
        let terms = policy_loss(
            &cfg,
            &[-1., -1.],
            &[-1., -1.],
            Some(&[-1.5, -1.]),
            &[0., 0.],
            &[1., 0.],
            1.,
        );

        assert_eq!(terms.coeffs, vec![0.1, 0.]);
        assert!((terms.kl - 0.5).abs() < 1e-6);
    }
}

use std::{collections::BTreeMap, io};

use log::{info, warn};

use crate::{RolloutId, rollout::RolloutData};

/// Named scalar metrics, keyed as `scope/name`.
pub type Metrics = BTreeMap<String, f64>;

/// Where metrics end up.
pub trait MetricsSink: Send + Sync {
    fn log(&self, rollout_id: RolloutId, metrics: &Metrics) -> io::Result<()>;
}

/// Writes metrics to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn log(&self, rollout_id: RolloutId, metrics: &Metrics) -> io::Result<()> {
        let line = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");

        info!("rollout {rollout_id}: {line}");
        Ok(())
    }
}

/// Sends `metrics` to `sink`, metrics failures never interrupt training.
pub fn log_metrics(sink: &dyn MetricsSink, rollout_id: RolloutId, metrics: &Metrics) {
    if metrics.is_empty() {
        return;
    }

    if let Err(e) = sink.log(rollout_id, metrics) {
        warn!("failed to log metrics for rollout {rollout_id}: {e}");
    }
}

/// Summarizes a rank's rollout data.
///
/// # Arguments
/// * `scope` - Prefix of every metric name.
/// * `data` - The rollout data.
///
/// # Returns
/// Sample level means plus the masked token mean of every per-token quantity.
pub fn rollout_metrics(scope: &str, data: &RolloutData) -> Metrics {
    let mut metrics = Metrics::new();
    let n = data.len().max(1) as f64;

    metrics.insert(format!("{scope}/samples"), data.len() as f64);
    metrics.insert(
        format!("{scope}/reward"),
        data.samples.iter().map(|s| s.reward as f64).sum::<f64>() / n,
    );
    metrics.insert(
        format!("{scope}/response_len"),
        data.response_tokens() as f64 / n,
    );
    metrics.insert(
        format!("{scope}/truncated"),
        data.samples.iter().filter(|s| s.truncated).count() as f64 / n,
    );

    for (key, rows) in &data.per_token {
        let (sum, count) = rows
            .iter()
            .zip(&data.samples)
            .flat_map(|(row, sample)| row.iter().zip(sample.mask()))
            .filter(|(_, m)| *m > 0.)
            .fold((0., 0usize), |(sum, count), (v, _)| (sum + *v as f64, count + 1));

        if count > 0 {
            metrics.insert(format!("{scope}/{key}"), sum / count as f64);
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::{ADVANTAGES, RolloutBatch, Sample};

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn log(&self, _: RolloutId, _: &Metrics) -> io::Result<()> {
            Err(io::Error::other("backend down"))
        }
    }

    #[test]
    fn summarizes_masked_tokens() {
        let batch = RolloutBatch {
            samples: vec![Sample {
                index: 0,
                group_index: 0,
                prompt_tokens: vec![0],
                response_tokens: vec![1, 2],
                loss_mask: Some(vec![1, 0]),
                reward: 2.,
                truncated: true,
                rollout_log_probs: None,
            }],
            ..Default::default()
        };
        let mut data = RolloutData::new(0, batch, 0, 1);
        data.insert(ADVANTAGES, vec![vec![4., 100.]]).unwrap();

        let metrics = rollout_metrics("rollout", &data);
        assert_eq!(metrics["rollout/reward"], 2.);
        assert_eq!(metrics["rollout/truncated"], 1.);
        assert_eq!(metrics["rollout/advantages"], 4.);
    }

    #[test]
    fn sink_failures_are_swallowed() {
        let metrics = Metrics::from([("a".to_string(), 1.)]);
        log_metrics(&FailingSink, 0, &metrics);
    }
}

mod dump;
mod metrics;
mod timer;

pub use dump::save_debug_train_data;
pub use metrics::{LogSink, Metrics, MetricsSink, log_metrics, rollout_metrics};
pub use timer::{Timer, TimerGuard};

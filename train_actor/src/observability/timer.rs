use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Timings {
    running: BTreeMap<String, Instant>,
    finished: BTreeMap<String, Duration>,
}

/// Named wall-clock timers shared across the process.
///
/// Ending a timer adds to its accumulated duration until `take` drains them.
#[derive(Debug, Default)]
pub struct Timer {
    timings: Mutex<Timings>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `name`, restarting it if it was already running.
    pub fn start(&self, name: &str) {
        self.timings
            .lock()
            .running
            .insert(name.to_string(), Instant::now());
    }

    /// Stops `name`.
    ///
    /// # Returns
    /// The elapsed time, or `None` if it wasn't running.
    pub fn end(&self, name: &str) -> Option<Duration> {
        let mut timings = self.timings.lock();
        let elapsed = timings.running.remove(name)?.elapsed();
        *timings.finished.entry(name.to_string()).or_default() += elapsed;
        Some(elapsed)
    }

    /// Times the guard's lifetime under `name`.
    pub fn scope<'t>(&'t self, name: &str) -> TimerGuard<'t> {
        self.start(name);
        TimerGuard {
            timer: self,
            name: name.to_string(),
        }
    }

    /// Drains the accumulated durations.
    pub fn take(&self) -> BTreeMap<String, Duration> {
        std::mem::take(&mut self.timings.lock().finished)
    }
}

/// Ends its timer when dropped.
#[derive(Debug)]
pub struct TimerGuard<'t> {
    timer: &'t Timer,
    name: String,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.end(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_until_taken() {
        let timer = Timer::new();
        {
            let _t = timer.scope("train");
        }
        timer.start("train");
        assert!(timer.end("train").is_some());
        assert!(timer.end("train").is_none());

        let taken = timer.take();
        assert!(taken.contains_key("train"));
        assert!(timer.take().is_empty());
    }
}

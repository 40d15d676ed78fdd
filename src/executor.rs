//! Units of work that go stale. Every task remembers when it was built; when it
//! finally reaches a worker after its verb's timeout the body is skipped and
//! the verb's dropped counter is bumped instead.

use crate::messaging::Verb;
use crate::telemetry::{SharedMetricsRegistry, TelemetryError};
use crate::util::MetaError;
use log::warn;
use std::time::{Duration, Instant};

fn log_metric_error<T>(context: &str, result: Result<T, TelemetryError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "event=telemetry_metric_error context={} error={}",
                context, err
            );
            None
        }
    }
}

/// Per-verb `messaging.dropped.<VERB>` counters.
#[derive(Debug, Clone)]
pub struct DroppedMessageCounter {
    metrics: SharedMetricsRegistry,
}

impl DroppedMessageCounter {
    pub fn new(metrics: SharedMetricsRegistry) -> Self {
        Self { metrics }
    }

    pub fn increment(&self, verb: Verb) {
        log_metric_error(
            "dropped_messages",
            self.metrics.inc_counter(Self::metric_name(verb), 1),
        );
    }

    pub fn count(&self, verb: Verb) -> u64 {
        log_metric_error("dropped_messages", self.metrics.counter(Self::metric_name(verb)))
            .unwrap_or(0)
    }

    fn metric_name(verb: Verb) -> String {
        format!("messaging.dropped.{}", verb.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Dropped,
    Failed,
}

type TaskBody = Box<dyn FnOnce() -> Result<(), MetaError> + Send>;

pub struct DroppableTask {
    verb: Verb,
    constructed_at: Instant,
    body: TaskBody,
}

impl DroppableTask {
    pub fn new<F>(verb: Verb, body: F) -> Self
    where
        F: FnOnce() -> Result<(), MetaError> + Send + 'static,
    {
        Self::constructed_at(verb, Instant::now(), body)
    }

    pub fn constructed_at<F>(verb: Verb, constructed_at: Instant, body: F) -> Self
    where
        F: FnOnce() -> Result<(), MetaError> + Send + 'static,
    {
        Self {
            verb,
            constructed_at,
            body: Box::new(body),
        }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn run(self, timeout: Duration, dropped: &DroppedMessageCounter) -> TaskOutcome {
        self.run_at(Instant::now(), timeout, dropped)
    }

    /// Executes the body unless `now - constructed_at >= timeout`. A failing
    /// body ends this unit only; nothing is retried.
    pub fn run_at(
        self,
        now: Instant,
        timeout: Duration,
        dropped: &DroppedMessageCounter,
    ) -> TaskOutcome {
        let waited = now.saturating_duration_since(self.constructed_at);
        if waited >= timeout {
            dropped.increment(self.verb);
            warn!(
                "event=task_dropped verb={} waited_ms={} timeout_ms={}",
                self.verb,
                waited.as_millis(),
                timeout.as_millis()
            );
            return TaskOutcome::Dropped;
        }
        match (self.body)() {
            Ok(()) => TaskOutcome::Completed,
            Err(err) => {
                warn!("event=task_failed verb={} error={}", self.verb, err);
                TaskOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn counter() -> DroppedMessageCounter {
        DroppedMessageCounter::new(SharedMetricsRegistry::new("test"))
    }

    #[test]
    fn stale_task_skips_body_and_counts_once() {
        let dropped = counter();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let built = Instant::now();
        let timeout = Duration::from_millis(2_000);
        let task = DroppableTask::constructed_at(Verb::Mutation, built, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let outcome = task.run_at(built + timeout + Duration::from_millis(1), timeout, &dropped);
        assert_eq!(outcome, TaskOutcome::Dropped);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(dropped.count(Verb::Mutation), 1);
        assert_eq!(dropped.count(Verb::DefinitionsUpdate), 0);
    }

    #[test]
    fn elapsed_equal_to_timeout_is_already_stale() {
        let dropped = counter();
        let built = Instant::now();
        let timeout = Duration::from_millis(50);
        let task = DroppableTask::constructed_at(Verb::MigrationRequest, built, || Ok(()));
        assert_eq!(task.run_at(built + timeout, timeout, &dropped), TaskOutcome::Dropped);
    }

    #[test]
    fn fresh_task_runs_and_failures_stay_local() {
        let dropped = counter();
        let built = Instant::now();
        let ok = DroppableTask::constructed_at(Verb::Mutation, built, || Ok(()));
        assert_eq!(
            ok.run_at(built, Duration::from_secs(1), &dropped),
            TaskOutcome::Completed
        );
        let failing = DroppableTask::constructed_at(Verb::Mutation, built, || {
            Err(MetaError::Other("disk full".into()))
        });
        assert_eq!(
            failing.run_at(built, Duration::from_secs(1), &dropped),
            TaskOutcome::Failed
        );
        assert_eq!(dropped.count(Verb::Mutation), 0);
    }
}

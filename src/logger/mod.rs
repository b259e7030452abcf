//! Orchestrator-side fan-out of run and discovery events to test loggers.

mod console;

pub use console::ConsoleLogger;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::HostSettings;
use crate::job_queue::JobQueue;
use crate::model::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestResult, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCompletePayload,
};
use crate::protocol::{DiscoveryEventsHandler, RunEventsHandler};
use crate::Result;

type LoggerJob = Box<dyn FnOnce() + Send>;
type SinkList = Mutex<Vec<(u64, Arc<dyn TestLoggerSink>)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A test logger. Every method has a no-op default.
pub trait TestLoggerSink: Send + Sync {
    fn on_test_result(&self, _result: &TestResult) {}

    fn on_message(&self, _level: TestMessageLevel, _message: &str) {}

    fn on_discovered_tests(&self, _tests: &[TestCase]) {}

    fn on_discovery_complete(&self, _complete: &DiscoveryCompletePayload) {}

    fn on_test_run_complete(&self, _complete: &TestRunCompleteEventArgs) {}
}

/// Registration of a sink; unsubscribes when dropped.
#[must_use = "dropping the subscription unsubscribes the logger"]
pub struct Subscription {
    id: u64,
    sinks: Weak<SinkList>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(sinks) = self.sinks.upgrade() {
            lock(&sinks).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Delivers events to subscribed loggers on a background queue.
///
/// Events raised before [`LoggerEvents::enable_events`] are held and then
/// delivered in order. Completion events drain the queue first, then reach
/// the loggers synchronously.
pub struct LoggerEvents {
    queue: JobQueue<LoggerJob>,
    sinks: Arc<SinkList>,
    next_id: AtomicU64,
}

impl LoggerEvents {
    pub fn new(settings: &HostSettings) -> Result<Self> {
        let queue = JobQueue::new(
            Box::new(|job: LoggerJob| job()),
            "Test Logger",
            settings.logger_queue_length,
            settings.logger_queue_size,
            settings.logger_queue_bounds,
            Arc::new(|e: String| tracing::error!("Test logger failed: {}", e)),
        )?;
        queue.pause();
        Ok(Self {
            queue,
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self, sink: Arc<dyn TestLoggerSink>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.sinks).push((id, sink));
        Subscription {
            id,
            sinks: Arc::downgrade(&self.sinks),
        }
    }

    /// Start delivering queued and future events.
    pub fn enable_events(&self) {
        self.queue.resume();
    }

    pub fn raise_test_result(&self, result: TestResult) -> Result<()> {
        let size = serialized_len(&result);
        self.dispatch(size, move |sink| sink.on_test_result(&result))
    }

    pub fn raise_message(&self, level: TestMessageLevel, message: &str) -> Result<()> {
        let message = message.to_string();
        self.dispatch(message.len(), move |sink| sink.on_message(level, &message))
    }

    pub fn raise_discovered_tests(&self, tests: Vec<TestCase>) -> Result<()> {
        let size = serialized_len(&tests);
        self.dispatch(size, move |sink| sink.on_discovered_tests(&tests))
    }

    pub fn complete_discovery(&self, complete: &DiscoveryCompletePayload) {
        self.drain();
        for sink in self.snapshot() {
            sink.on_discovery_complete(complete);
        }
    }

    pub fn complete_test_run(&self, complete: &TestRunCompleteEventArgs) {
        self.drain();
        for sink in self.snapshot() {
            sink.on_test_run_complete(complete);
        }
    }

    fn dispatch(&self, size: usize, deliver: impl Fn(&dyn TestLoggerSink) + Send + 'static) -> Result<()> {
        let sinks = Arc::downgrade(&self.sinks);
        self.queue.queue_job(
            Box::new(move || {
                let Some(sinks) = sinks.upgrade() else {
                    return;
                };
                let current: Vec<_> = lock(&sinks).iter().map(|(_, s)| Arc::clone(s)).collect();
                for sink in current {
                    deliver(sink.as_ref());
                }
            }),
            size,
        )
    }

    /// Wait for queued events. Skipped while events are disabled, since a
    /// paused queue would never drain.
    fn drain(&self) {
        if self.queue.is_paused() {
            tracing::debug!("Logger events disabled, completing without draining");
            return;
        }
        if let Err(e) = self.queue.flush() {
            tracing::warn!("Could not flush logger events: {}", e);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn TestLoggerSink>> {
        lock(&self.sinks).iter().map(|(_, s)| Arc::clone(s)).collect()
    }
}

/// Feeds protocol events from a testhost into [`LoggerEvents`] and keeps
/// the final completions for the caller.
pub struct LoggerEventsHandler {
    events: Arc<LoggerEvents>,
    discovery_complete: Mutex<Option<DiscoveryCompletePayload>>,
    run_complete: Mutex<Option<TestRunCompleteEventArgs>>,
}

impl LoggerEventsHandler {
    pub fn new(events: Arc<LoggerEvents>) -> Self {
        Self {
            events,
            discovery_complete: Mutex::new(None),
            run_complete: Mutex::new(None),
        }
    }

    pub fn discovery_outcome(&self) -> Option<DiscoveryCompletePayload> {
        lock(&self.discovery_complete).clone()
    }

    pub fn run_outcome(&self) -> Option<TestRunCompleteEventArgs> {
        lock(&self.run_complete).clone()
    }

    fn raise_results(&self, args: TestRunChangedEventArgs) {
        for result in args.new_test_results {
            if let Err(e) = self.events.raise_test_result(result) {
                tracing::warn!("Dropped test result: {}", e);
            }
        }
    }

    fn raise_message(&self, level: TestMessageLevel, message: &str) {
        if let Err(e) = self.events.raise_message(level, message) {
            tracing::warn!("Dropped test message: {}", e);
        }
    }
}

impl DiscoveryEventsHandler for LoggerEventsHandler {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        if let Err(e) = self.events.raise_discovered_tests(tests) {
            tracing::warn!("Dropped discovered tests: {}", e);
        }
    }

    fn handle_discovery_complete(&self, mut complete: DiscoveryCompletePayload) {
        if let Some(last) = complete.last_discovered_tests.take().filter(|t| !t.is_empty()) {
            self.handle_discovered_tests(last);
        }
        self.events.complete_discovery(&complete);
        *lock(&self.discovery_complete) = Some(complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.raise_message(level, message);
    }
}

impl RunEventsHandler for LoggerEventsHandler {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.raise_results(args);
    }

    fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
        if let Some(last) = complete.last_run_tests {
            self.raise_results(last);
        }
        self.events.complete_test_run(&complete.test_run_complete_args);
        *lock(&self.run_complete) = Some(complete.test_run_complete_args);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.raise_message(level, message);
    }
}

fn serialized_len<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(1).max(1)
}

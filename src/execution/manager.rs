use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::run_cache::TestRunCache;
use crate::adapter::{matches_extension, AdapterRegistry, FrameworkHandle, MessageLogger, TestExecutor};
use crate::model::{
    TestCase, TestMessageLevel, TestOutcome, TestResult, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCompletePayload, TestRunCriteria,
};
use crate::protocol::RunEventsHandler;
use crate::session::{metric_names, SessionContext};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What executors report through during one run.
struct RunContext<'a> {
    cache: &'a TestRunCache,
    handler: &'a dyn RunEventsHandler,
    cancelled: &'a AtomicBool,
    aborted: &'a AtomicBool,
}

impl MessageLogger for RunContext<'_> {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.handler.handle_log_message(level, message);
    }
}

impl FrameworkHandle for RunContext<'_> {
    fn record_start(&self, test_case: &TestCase) {
        self.cache.on_new_test_started(test_case);
    }

    fn record_result(&self, result: TestResult) {
        self.cache.on_new_test_result(result);
    }

    fn record_end(&self, test_case: &TestCase, outcome: TestOutcome) {
        tracing::trace!("{} finished: {:?}", test_case.fully_qualified_name, outcome);
        self.cache.on_test_completion(test_case);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }
}

enum Work {
    Sources(Vec<String>),
    Tests(Vec<TestCase>),
}

/// Testhost side of a test run. One manager serves one run, so a cancel
/// that arrives before the run starts still applies to it.
pub struct ExecutionManager {
    registry: AdapterRegistry,
    session: Arc<SessionContext>,
    cancelled: AtomicBool,
    aborted: AtomicBool,
    finished: AtomicBool,
    active: Mutex<Option<Arc<dyn TestExecutor>>>,
}

impl ExecutionManager {
    pub fn new(registry: AdapterRegistry, session: Arc<SessionContext>) -> Self {
        Self {
            registry,
            session,
            cancelled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    /// Run the criteria's sources or tests, reporting stats changes and
    /// then one completion to `handler`.
    pub fn run_tests(&self, criteria: &TestRunCriteria, handler: Arc<dyn RunEventsHandler>) {
        let started = Instant::now();

        let settings = &self.session.settings;
        let cache_size = match criteria.frequency_of_run_stats_change_event {
            0 => settings.run_cache_size,
            n => n,
        };
        let cache_timeout = match criteria.run_stats_change_event_timeout_ms {
            0 => Duration::from_millis(settings.run_cache_timeout_ms),
            ms => Duration::from_millis(ms),
        };
        let stats_handler = handler.clone();
        let cache = TestRunCache::new(
            cache_size,
            cache_timeout,
            Box::new(move |args: TestRunChangedEventArgs| stats_handler.handle_test_run_stats_change(args)),
        );
        let context = RunContext {
            cache: &cache,
            handler: handler.as_ref(),
            cancelled: &self.cancelled,
            aborted: &self.aborted,
        };

        let mut executor_uris = Vec::new();
        let mut error = None;
        for (uri, work) in self.plan(criteria, handler.as_ref()) {
            if context.is_cancelled() {
                break;
            }
            let Some(executor) = self.registry.executor(&uri) else {
                let message = format!("Could not find test executor with URI '{}'.", uri);
                tracing::warn!("{}", message);
                handler.handle_log_message(TestMessageLevel::Warning, &message);
                continue;
            };

            *lock(&self.active) = Some(executor.clone());
            let executed_before = cache.total_executed_tests();
            let result = match &work {
                Work::Sources(sources) => executor.run_tests_from_sources(sources, &context),
                Work::Tests(tests) => executor.run_tests(tests, &context),
            };
            *lock(&self.active) = None;

            if let Err(e) = result {
                let message = format!("Executor '{}' failed: {}", uri, e);
                tracing::error!("{}", message);
                handler.handle_log_message(TestMessageLevel::Error, &message);
                error.get_or_insert(message);
            }
            self.session.metrics.add(
                &format!("{}.{}", metric_names::TESTS_RUN_BY_ADAPTER, uri),
                cache.total_executed_tests() - executed_before,
            );
            executor_uris.push(uri);
        }

        let is_canceled = self.cancelled.load(Ordering::SeqCst);
        let is_aborted = self.aborted.load(Ordering::SeqCst);
        let elapsed = started.elapsed();
        let statistics = cache.statistics();
        let last_chunk = cache.take_last_chunk();

        let metrics = &self.session.metrics;
        metrics.add(metric_names::TOTAL_TESTS_RUN, statistics.executed_tests);
        metrics.add_to(metric_names::EXECUTION_TIME_ALL_ADAPTERS, elapsed.as_secs_f64());
        metrics.add(
            metric_names::RUN_STATE,
            match (is_aborted, is_canceled) {
                (true, _) => "Aborted",
                (_, true) => "Canceled",
                _ => "Completed",
            },
        );
        tracing::info!(
            "Run completed: {} test(s) in {} ms (canceled: {}, aborted: {})",
            statistics.executed_tests,
            elapsed.as_millis(),
            is_canceled,
            is_aborted
        );

        handler.handle_test_run_complete(TestRunCompletePayload {
            test_run_complete_args: TestRunCompleteEventArgs {
                test_run_statistics: Some(statistics),
                is_canceled,
                is_aborted,
                error,
                elapsed_time_ms: elapsed.as_millis() as u64,
                attachment_sets: Vec::new(),
            },
            last_run_tests: Some(last_chunk),
            run_attachments: Vec::new(),
            executor_uris,
        });
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Whether the completion has been reported.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stop after the test in flight; the run completes as canceled.
    pub fn cancel(&self) {
        tracing::info!("Cancelling test run");
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(executor) = lock(&self.active).clone() {
            executor.cancel();
        }
    }

    pub fn abort(&self) {
        tracing::warn!("Aborting test run");
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(executor) = lock(&self.active).clone() {
            executor.cancel();
        }
    }

    /// Group the run into (executor uri, work) pairs in first-seen order.
    fn plan(&self, criteria: &TestRunCriteria, logger: &dyn RunEventsHandler) -> Vec<(String, Work)> {
        let mut plan: Vec<(String, Work)> = Vec::new();

        if let Some(tests) = criteria.tests.as_ref().filter(|t| !t.is_empty()) {
            for test in tests {
                match plan.iter_mut().find(|(uri, _)| uri.eq_ignore_ascii_case(&test.executor_uri)) {
                    Some((_, Work::Tests(group))) => group.push(test.clone()),
                    _ => plan.push((test.executor_uri.clone(), Work::Tests(vec![test.clone()]))),
                }
            }
            return plan;
        }

        let sources = criteria.sources.as_deref().unwrap_or_default();
        for source in sources {
            let discoverer = self
                .registry
                .discoverers()
                .iter()
                .find(|d| matches_extension(d.file_extensions(), source));
            let Some(discoverer) = discoverer else {
                let message = format!("No test executor is registered to handle '{}'.", source);
                tracing::warn!("{}", message);
                logger.handle_log_message(TestMessageLevel::Warning, &message);
                continue;
            };
            let uri = discoverer.default_executor_uri();
            match plan.iter_mut().find(|(u, _)| u == uri) {
                Some((_, Work::Sources(group))) => group.push(source.clone()),
                _ => plan.push((uri.to_string(), Work::Sources(vec![source.clone()]))),
            }
        }
        plan
    }
}

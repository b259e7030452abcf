use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::model::{TestCase, TestResult, TestRunChangedEventArgs, TestRunStatistics};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub type OnCacheHit = Box<dyn FnMut(TestRunChangedEventArgs) + Send>;

struct RunCacheState {
    results: Vec<TestResult>,
    in_progress: Vec<TestCase>,
    statistics: TestRunStatistics,
    last_update: Instant,
    on_cache_hit: OnCacheHit,
}

impl RunCacheState {
    fn take_chunk(&mut self) -> TestRunChangedEventArgs {
        self.last_update = Instant::now();
        TestRunChangedEventArgs {
            test_run_statistics: Some(self.statistics.clone()),
            new_test_results: std::mem::take(&mut self.results),
            active_tests: self.in_progress.clone(),
        }
    }
}

/// Collects results of a run and reports them as stats-change batches.
pub struct TestRunCache {
    cache_size: usize,
    cache_timeout: Duration,
    state: Mutex<RunCacheState>,
}

impl TestRunCache {
    pub fn new(cache_size: usize, cache_timeout: Duration, on_cache_hit: OnCacheHit) -> Self {
        Self {
            cache_size: cache_size.max(1),
            cache_timeout,
            state: Mutex::new(RunCacheState {
                results: Vec::new(),
                in_progress: Vec::new(),
                statistics: TestRunStatistics::default(),
                last_update: Instant::now(),
                on_cache_hit,
            }),
        }
    }

    pub fn on_new_test_started(&self, test_case: &TestCase) {
        let mut state = lock(&self.state);
        if !state.in_progress.iter().any(|t| t.id == test_case.id) {
            state.in_progress.push(test_case.clone());
        }
        self.check_for_cache_hit(&mut state);
    }

    pub fn on_new_test_result(&self, result: TestResult) {
        let mut state = lock(&self.state);
        state.statistics.record(result.outcome);
        let id = result.test_case.id;
        state.in_progress.retain(|t| t.id != id);
        state.results.push(result);
        self.check_for_cache_hit(&mut state);
    }

    /// Mark a test finished without a result, e.g. after a crash report.
    pub fn on_test_completion(&self, test_case: &TestCase) {
        lock(&self.state).in_progress.retain(|t| t.id != test_case.id);
    }

    /// Pending results and statistics, leaving the cache empty.
    pub fn take_last_chunk(&self) -> TestRunChangedEventArgs {
        lock(&self.state).take_chunk()
    }

    pub fn statistics(&self) -> TestRunStatistics {
        lock(&self.state).statistics.clone()
    }

    pub fn total_executed_tests(&self) -> u64 {
        lock(&self.state).statistics.executed_tests
    }

    pub fn in_progress(&self) -> Vec<TestCase> {
        lock(&self.state).in_progress.clone()
    }

    fn check_for_cache_hit(&self, state: &mut RunCacheState) {
        if state.results.len() >= self.cache_size
            || (!state.results.is_empty() && state.last_update.elapsed() >= self.cache_timeout)
        {
            let chunk = state.take_chunk();
            (state.on_cache_hit)(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestOutcome;
    use std::sync::{Arc, Mutex};

    fn case(name: &str) -> TestCase {
        TestCase::new(name, "executor://test", "/bin/tests")
    }

    fn recording() -> (Arc<Mutex<Vec<TestRunChangedEventArgs>>>, OnCacheHit) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let on_hit: OnCacheHit = Box::new(move |args: TestRunChangedEventArgs| sink.lock().unwrap().push(args));
        (chunks, on_hit)
    }

    #[test]
    fn test_results_flush_at_cache_size() {
        let (chunks, on_hit) = recording();
        let cache = TestRunCache::new(2, Duration::from_secs(60), on_hit);
        let (a, b, c) = (case("a"), case("b"), case("c"));

        cache.on_new_test_started(&a);
        cache.on_new_test_result(TestResult::new(a, TestOutcome::Passed));
        cache.on_new_test_started(&b);
        cache.on_new_test_started(&c);
        cache.on_new_test_result(TestResult::new(b, TestOutcome::Failed));

        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].new_test_results.len(), 2);
        let active: Vec<_> = chunks[0].active_tests.iter().map(|t| t.fully_qualified_name.as_str()).collect();
        assert_eq!(active, vec!["c"]);
        let stats = chunks[0].test_run_statistics.as_ref().unwrap();
        assert_eq!(stats.executed_tests, 2);
        assert_eq!(stats.count(TestOutcome::Failed), 1);
    }

    #[test]
    fn test_started_events_alone_do_not_flush() {
        let (chunks, on_hit) = recording();
        let cache = TestRunCache::new(1, Duration::ZERO, on_hit);
        cache.on_new_test_started(&case("a"));
        assert!(chunks.lock().unwrap().is_empty());
        assert_eq!(cache.in_progress().len(), 1);
    }

    #[test]
    fn test_last_chunk_carries_remainder_and_totals() {
        let (chunks, on_hit) = recording();
        let cache = TestRunCache::new(10, Duration::from_secs(60), on_hit);
        for name in ["a", "b", "c"] {
            cache.on_new_test_result(TestResult::new(case(name), TestOutcome::Skipped));
        }
        assert!(chunks.lock().unwrap().is_empty());

        let last = cache.take_last_chunk();
        assert_eq!(last.new_test_results.len(), 3);
        assert_eq!(cache.total_executed_tests(), 3);
        assert!(cache.take_last_chunk().new_test_results.is_empty());
        assert_eq!(cache.statistics().count(TestOutcome::Skipped), 3);
    }

    #[test]
    fn test_completion_without_result_clears_in_progress() {
        let (_chunks, on_hit) = recording();
        let cache = TestRunCache::new(10, Duration::from_secs(60), on_hit);
        let a = case("a");
        cache.on_new_test_started(&a);
        cache.on_new_test_started(&a);
        assert_eq!(cache.in_progress().len(), 1);
        cache.on_test_completion(&a);
        assert!(cache.in_progress().is_empty());
    }
}

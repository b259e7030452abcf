use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::model::TestCase;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub type OnReportTestCases = Box<dyn FnMut(Vec<TestCase>) + Send>;

struct CacheState {
    tests: Vec<TestCase>,
    total: u64,
    last_update: Instant,
    /// Sequence number handed to the next batch.
    next_batch: u64,
}

struct Reporter {
    /// Sequence number of the batch allowed to report next.
    turn: u64,
    on_report: OnReportTestCases,
}

/// Buffers discovered tests and hands them out in batches once either
/// `cache_size` tests are pending or `cache_timeout` has passed since the
/// last batch.
pub struct DiscoveryResultCache {
    cache_size: usize,
    cache_timeout: Duration,
    state: Mutex<CacheState>,
    reporter: Mutex<Reporter>,
    turn_changed: Condvar,
}

impl DiscoveryResultCache {
    pub fn new(cache_size: usize, cache_timeout: Duration, on_report: OnReportTestCases) -> Self {
        Self {
            cache_size: cache_size.max(1),
            cache_timeout,
            state: Mutex::new(CacheState {
                tests: Vec::with_capacity(cache_size.max(1)),
                total: 0,
                last_update: Instant::now(),
                next_batch: 0,
            }),
            reporter: Mutex::new(Reporter { turn: 0, on_report }),
            turn_changed: Condvar::new(),
        }
    }

    /// Invalid test cases are logged and skipped.
    ///
    /// The callback runs outside the cache lock, so it may query the cache.
    /// Batches still reach it one at a time, in the order they were cut.
    pub fn add_test(&self, test: TestCase) {
        if !test.is_valid() {
            tracing::warn!(
                "Skipping invalid test case '{}' from '{}'",
                test.fully_qualified_name,
                test.source
            );
            return;
        }

        let (batch, ticket) = {
            let mut state = lock(&self.state);
            state.tests.push(test);
            state.total += 1;

            if state.tests.len() < self.cache_size && state.last_update.elapsed() < self.cache_timeout {
                return;
            }
            let batch = std::mem::replace(&mut state.tests, Vec::with_capacity(self.cache_size));
            state.last_update = Instant::now();
            let ticket = state.next_batch;
            state.next_batch += 1;
            (batch, ticket)
        };

        let mut reporter = lock(&self.reporter);
        while reporter.turn != ticket {
            reporter = self
                .turn_changed
                .wait(reporter)
                .unwrap_or_else(|e| e.into_inner());
        }
        (reporter.on_report)(batch);
        reporter.turn += 1;
        drop(reporter);
        self.turn_changed.notify_all();
    }

    /// Tests added since the last batch.
    pub fn tests(&self) -> Vec<TestCase> {
        lock(&self.state).tests.clone()
    }

    /// Take the pending tests, leaving the cache empty.
    pub fn take_tests(&self) -> Vec<TestCase> {
        let mut state = lock(&self.state);
        state.last_update = Instant::now();
        std::mem::take(&mut state.tests)
    }

    pub fn total_discovered_tests(&self) -> u64 {
        lock(&self.state).total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex, OnceLock};

    fn case(name: &str) -> TestCase {
        TestCase::new(name, "executor://test", "/bin/tests")
    }

    fn recording() -> (Arc<Mutex<Vec<Vec<String>>>>, OnReportTestCases) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let on_report: OnReportTestCases = Box::new(move |batch: Vec<TestCase>| {
            sink.lock()
                .unwrap()
                .push(batch.into_iter().map(|t| t.fully_qualified_name).collect());
        });
        (batches, on_report)
    }

    #[test]
    fn test_count_threshold_reports_once() {
        let (batches, on_report) = recording();
        let cache = DiscoveryResultCache::new(3, Duration::from_secs(3600), on_report);
        cache.add_test(case("a"));
        cache.add_test(case("b"));
        assert!(batches.lock().unwrap().is_empty());
        cache.add_test(case("c"));

        assert_eq!(*batches.lock().unwrap(), vec![vec!["a", "b", "c"]]);
        assert!(cache.tests().is_empty());
        assert_eq!(cache.total_discovered_tests(), 3);
    }

    #[test]
    fn test_zero_timeout_reports_immediately() {
        let (batches, on_report) = recording();
        let cache = DiscoveryResultCache::new(100, Duration::ZERO, on_report);
        cache.add_test(case("only"));
        assert_eq!(*batches.lock().unwrap(), vec![vec!["only"]]);
    }

    #[test]
    fn test_elapsed_timeout_flushes_pending() {
        let (batches, on_report) = recording();
        let cache = DiscoveryResultCache::new(100, Duration::from_millis(20), on_report);
        cache.add_test(case("a"));
        std::thread::sleep(Duration::from_millis(40));
        cache.add_test(case("b"));
        let batches = batches.lock().unwrap();
        assert_eq!(batches.last().unwrap(), &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_invalid_test_case_skipped() {
        let (batches, on_report) = recording();
        let cache = DiscoveryResultCache::new(1, Duration::from_secs(60), on_report);
        cache.add_test(case(""));
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(cache.total_discovered_tests(), 0);
    }

    #[test]
    fn test_take_tests_returns_remainder() {
        let (_batches, on_report) = recording();
        let cache = DiscoveryResultCache::new(10, Duration::from_secs(60), on_report);
        cache.add_test(case("a"));
        cache.add_test(case("b"));
        let rest: Vec<_> = cache.take_tests().into_iter().map(|t| t.fully_qualified_name).collect();
        assert_eq!(rest, vec!["a", "b"]);
        assert!(cache.tests().is_empty());
        assert_eq!(cache.total_discovered_tests(), 2);
    }

    #[test]
    fn test_concurrent_adds_preserve_total() {
        let (batches, on_report) = recording();
        let cache = Arc::new(DiscoveryResultCache::new(7, Duration::from_secs(60), on_report));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        cache.add_test(case(&format!("t{}_{}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let reported: usize = batches.lock().unwrap().iter().map(|b| b.len()).sum();
        assert_eq!(reported + cache.tests().len(), 100);
        assert_eq!(cache.total_discovered_tests(), 100);
    }

    #[test]
    fn test_callback_can_query_cache() {
        let cache_slot: Arc<OnceLock<Arc<DiscoveryResultCache>>> = Arc::new(OnceLock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_report: OnReportTestCases = {
            let cache_slot = cache_slot.clone();
            let seen = seen.clone();
            Box::new(move |batch: Vec<TestCase>| {
                let cache = cache_slot.get().unwrap();
                seen.lock()
                    .unwrap()
                    .push((batch.len(), cache.total_discovered_tests(), cache.tests().len()));
            })
        };
        let cache = Arc::new(DiscoveryResultCache::new(2, Duration::from_secs(60), on_report));
        assert!(cache_slot.set(cache.clone()).is_ok());

        let adder = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for name in ["a", "b", "c", "d"] {
                    cache.add_test(case(name));
                }
            })
        };
        adder.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(2, 2, 0), (2, 4, 0)]);
    }

    #[test]
    fn test_concurrent_batches_report_in_cut_order() {
        let (batches, on_report) = recording();
        let cache = Arc::new(DiscoveryResultCache::new(1, Duration::from_secs(60), on_report));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        cache.add_test(case(&format!("t{}_{:02}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 80);
        for t in 0..4 {
            let prefix = format!("t{}_", t);
            let own: Vec<&String> = batches.iter().flatten().filter(|n| n.starts_with(&prefix)).collect();
            let mut sorted = own.clone();
            sorted.sort();
            assert_eq!(own, sorted);
        }
    }
}

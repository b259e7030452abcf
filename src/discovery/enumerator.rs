use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::{matches_extension, AdapterRegistry, DiscoverySink, MessageLogger};
use crate::model::{TestCase, TestMessageLevel};
use crate::session::{metric_names, SessionContext};

struct CountingSink<'a> {
    inner: &'a dyn DiscoverySink,
    count: AtomicU64,
}

impl DiscoverySink for CountingSink<'_> {
    fn send_test_case(&self, test_case: TestCase) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.inner.send_test_case(test_case);
    }
}

/// Runs each registered discoverer over the sources it handles.
pub struct DiscovererEnumerator {
    registry: AdapterRegistry,
    session: Arc<SessionContext>,
}

impl DiscovererEnumerator {
    pub fn new(registry: AdapterRegistry, session: Arc<SessionContext>) -> Self {
        Self { registry, session }
    }

    /// Discover tests in `sources`, forwarding each test case to `sink`.
    ///
    /// A failing discoverer is reported through `logger` and the remaining
    /// discoverers still run. Returns the number of test cases the
    /// discoverers produced.
    pub fn load_tests(&self, sources: &[String], logger: &dyn MessageLogger, sink: &dyn DiscoverySink) -> u64 {
        let started = Instant::now();
        let metrics = &self.session.metrics;
        let mut total = 0;
        let mut adapters_used = 0u64;

        for source in sources {
            let handled = self
                .registry
                .discoverers()
                .iter()
                .any(|d| matches_extension(d.file_extensions(), source));
            if !handled {
                let message = format!("No test discoverer is registered to handle '{}'.", source);
                tracing::warn!("{}", message);
                logger.send_message(TestMessageLevel::Warning, &message);
            }
        }

        for discoverer in self.registry.discoverers() {
            let matching: Vec<String> = sources
                .iter()
                .filter(|s| matches_extension(discoverer.file_extensions(), s))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            adapters_used += 1;

            let counting = CountingSink {
                inner: sink,
                count: AtomicU64::new(0),
            };
            let adapter_started = Instant::now();
            tracing::info!("Discovering tests with {} in {} source(s)", discoverer.name(), matching.len());

            if let Err(e) = discoverer.discover_tests(&matching, logger, &counting) {
                let message = format!("Discoverer '{}' failed: {}", discoverer.name(), e);
                tracing::error!("{}", message);
                logger.send_message(TestMessageLevel::Error, &message);
            }

            let found = counting.count.load(Ordering::Relaxed);
            total += found;
            metrics.add(
                &format!("{}.{}", metric_names::DISCOVERY_TIME_BY_ADAPTER, discoverer.name()),
                adapter_started.elapsed().as_secs_f64(),
            );
            metrics.add(
                &format!("{}.{}", metric_names::TESTS_DISCOVERED_BY_ADAPTER, discoverer.name()),
                found,
            );
            tracing::debug!("{} found {} test(s)", discoverer.name(), found);
        }

        metrics.add(metric_names::ADAPTERS_USED, adapters_used);
        metrics.add_to(metric_names::DISCOVERY_TIME_ALL_ADAPTERS, started.elapsed().as_secs_f64());
        total
    }
}

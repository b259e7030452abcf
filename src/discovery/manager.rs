use std::sync::Arc;
use std::time::Duration;

use super::cache::DiscoveryResultCache;
use super::enumerator::DiscovererEnumerator;
use crate::adapter::{AdapterRegistry, DiscoverySink};
use crate::model::{DiscoveryCompletePayload, DiscoveryCriteria, TestCase};
use crate::protocol::{DiscoveryEventsHandler, DiscoveryLogger};
use crate::session::{metric_names, SessionContext};

impl DiscoverySink for DiscoveryResultCache {
    fn send_test_case(&self, test_case: TestCase) {
        self.add_test(test_case);
    }
}

/// Testhost side of a discovery request.
pub struct DiscoveryManager {
    enumerator: DiscovererEnumerator,
    session: Arc<SessionContext>,
}

impl DiscoveryManager {
    pub fn new(registry: AdapterRegistry, session: Arc<SessionContext>) -> Self {
        Self {
            enumerator: DiscovererEnumerator::new(registry, session.clone()),
            session,
        }
    }

    /// Discover the criteria's sources, reporting batches and then one
    /// completion to `handler`.
    pub fn discover(&self, criteria: &DiscoveryCriteria, handler: Arc<dyn DiscoveryEventsHandler>) {
        let settings = &self.session.settings;
        let cache_size = match criteria.frequency_of_discovered_test_events {
            0 => settings.discovery_cache_size,
            n => n,
        };
        let cache_timeout = match criteria.discovered_test_event_timeout_ms {
            0 => Duration::from_millis(settings.discovery_cache_timeout_ms),
            ms => Duration::from_millis(ms),
        };

        let batch_handler = handler.clone();
        let cache = DiscoveryResultCache::new(
            cache_size,
            cache_timeout,
            Box::new(move |batch: Vec<TestCase>| batch_handler.handle_discovered_tests(batch)),
        );

        tracing::info!("Discovery started for {} source(s)", criteria.sources.len());
        self.enumerator
            .load_tests(&criteria.sources, &DiscoveryLogger(handler.as_ref()), &cache);

        let total = cache.total_discovered_tests();
        let last_chunk = cache.take_tests();
        self.session.metrics.add(metric_names::TOTAL_TESTS_DISCOVERED, total);
        self.session.metrics.add(metric_names::DISCOVERY_STATE, "Completed");
        tracing::info!("Discovery completed: {} test(s)", total);

        handler.handle_discovery_complete(DiscoveryCompletePayload {
            total_tests: i64::try_from(total).unwrap_or(i64::MAX),
            last_discovered_tests: Some(last_chunk),
            is_aborted: false,
        });
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::config::HostSettings;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Metric keys recorded during a session.
pub mod metric_names {
    pub const DISCOVERY_STATE: &str = "VS.TestDiscovery.DiscoveryState";
    pub const TOTAL_TESTS_DISCOVERED: &str = "VS.TestDiscovery.TotalTests";
    pub const ADAPTERS_USED: &str = "VS.TestDiscovery.NumberOfAdapterUsedToDiscoverTests";
    pub const DISCOVERY_TIME_ALL_ADAPTERS: &str = "VS.TestDiscovery.AdaptersTimeTakenInSec";
    pub const DISCOVERY_TIME_BY_ADAPTER: &str = "VS.TestDiscovery.TimeTakenInSecByAdapter";
    pub const TESTS_DISCOVERED_BY_ADAPTER: &str = "VS.TestDiscovery.TotalTestsDiscoveredByAdapter";

    pub const RUN_STATE: &str = "VS.TestRun.RunState";
    pub const TOTAL_TESTS_RUN: &str = "VS.TestRun.TotalTests";
    pub const EXECUTION_TIME_ALL_ADAPTERS: &str = "VS.TestRun.AdaptersTimeTakenInSec";
    pub const TESTS_RUN_BY_ADAPTER: &str = "VS.TestRun.TotalTestsRunByAdapter";

    pub const CONNECTION_TIME: &str = "VS.TestHost.ConnectionTimeInSec";
}

/// Named values collected over one session.
#[derive(Debug, Default)]
pub struct MetricsCollection {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MetricsCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, value: impl Into<Value>) {
        lock(&self.values).insert(name.to_string(), value.into());
    }

    /// Add to a numeric metric, starting from zero.
    pub fn add_to(&self, name: &str, delta: f64) {
        let mut values = lock(&self.values);
        let current = values.get(name).and_then(Value::as_f64).unwrap_or(0.0);
        values.insert(name.to_string(), Value::from(current + delta));
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.values).get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        lock(&self.values).clone()
    }
}

/// State owned by one test session, passed explicitly to the components
/// that need it.
#[derive(Debug)]
pub struct SessionContext {
    pub id: Uuid,
    pub settings: HostSettings,
    pub metrics: MetricsCollection,
    started: Instant,
}

impl SessionContext {
    pub fn new(settings: HostSettings) -> Arc<Self> {
        let id = Uuid::new_v4();
        tracing::debug!("Session {} created", id);
        Arc::new(Self {
            id,
            settings,
            metrics: MetricsCollection::new(),
            started: Instant::now(),
        })
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        tracing::debug!("Session {} ended after {} ms", self.id, self.elapsed_ms());
    }
}

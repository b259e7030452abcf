pub mod libtest;

use std::path::Path;
use std::sync::Arc;

use crate::model::{TestCase, TestMessageLevel, TestOutcome, TestResult};
use crate::Result;

/// Receives log messages from an adapter.
pub trait MessageLogger: Send + Sync {
    fn send_message(&self, level: TestMessageLevel, message: &str);
}

/// Receives test cases as an adapter finds them.
pub trait DiscoverySink: Send + Sync {
    fn send_test_case(&self, test_case: TestCase);
}

/// What an executor reports through while running tests.
pub trait FrameworkHandle: MessageLogger {
    fn record_start(&self, test_case: &TestCase);
    fn record_result(&self, result: TestResult);
    fn record_end(&self, test_case: &TestCase, outcome: TestOutcome);
    /// Checked between tests; executors stop early once it is set.
    fn is_cancelled(&self) -> bool;
}

pub trait TestDiscoverer: Send + Sync {
    /// Human-readable name: "libtest"
    fn name(&self) -> &str;

    /// Source extensions this discoverer handles. `""` matches sources
    /// without an extension.
    fn file_extensions(&self) -> &[&str];

    /// Executor that runs the tests this discoverer finds.
    fn default_executor_uri(&self) -> &str;

    fn discover_tests(
        &self,
        sources: &[String],
        logger: &dyn MessageLogger,
        sink: &dyn DiscoverySink,
    ) -> Result<()>;
}

pub trait TestExecutor: Send + Sync {
    fn executor_uri(&self) -> &str;

    fn run_tests_from_sources(&self, sources: &[String], handle: &dyn FrameworkHandle) -> Result<()>;

    fn run_tests(&self, tests: &[TestCase], handle: &dyn FrameworkHandle) -> Result<()>;

    /// Stop the run in progress as soon as possible.
    fn cancel(&self);
}

pub fn matches_extension(extensions: &[&str], source: &str) -> bool {
    let extension = Path::new(source)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    extensions.iter().any(|e| e.eq_ignore_ascii_case(extension))
}

/// Discoverers and executors known to a testhost.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    discoverers: Vec<Arc<dyn TestDiscoverer>>,
    executors: Vec<Arc<dyn TestExecutor>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters.
    pub fn builtin() -> Self {
        let libtest = Arc::new(libtest::LibtestAdapter::new());
        let mut registry = Self::new();
        registry.add_discoverer(libtest.clone());
        registry.add_executor(libtest);
        registry
    }

    pub fn add_discoverer(&mut self, discoverer: Arc<dyn TestDiscoverer>) {
        self.discoverers.push(discoverer);
    }

    pub fn add_executor(&mut self, executor: Arc<dyn TestExecutor>) {
        self.executors.push(executor);
    }

    pub fn discoverers(&self) -> &[Arc<dyn TestDiscoverer>] {
        &self.discoverers
    }

    pub fn executors(&self) -> &[Arc<dyn TestExecutor>] {
        &self.executors
    }

    pub fn executor(&self, uri: &str) -> Option<Arc<dyn TestExecutor>> {
        self.executors
            .iter()
            .find(|e| e.executor_uri().eq_ignore_ascii_case(uri))
            .cloned()
    }
}

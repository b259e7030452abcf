#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vstest::adapter::{
    AdapterRegistry, DiscoverySink, FrameworkHandle, MessageLogger, TestDiscoverer, TestExecutor,
};
use vstest::model::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestOutcome, TestResult,
    TestRunChangedEventArgs, TestRunCompletePayload,
};
use vstest::protocol::{DiscoveryEventsHandler, RunEventsHandler};

pub const FAKE_URI: &str = "executor://fake/v1";

/// In-memory adapter: every source holds the same named tests. A test
/// whose name ends in `fails` fails; one ending in `hangs` waits for
/// cancellation.
pub struct FakeAdapter {
    pub tests: Vec<&'static str>,
}

impl FakeAdapter {
    fn run(&self, cases: Vec<TestCase>, handle: &dyn FrameworkHandle) {
        for case in cases {
            if handle.is_cancelled() {
                return;
            }
            if case.fully_qualified_name.ends_with("hangs") {
                while !handle.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return;
            }
            handle.record_start(&case);
            let outcome = if case.fully_qualified_name.ends_with("fails") {
                TestOutcome::Failed
            } else {
                TestOutcome::Passed
            };
            let mut result = TestResult::new(case.clone(), outcome);
            if outcome == TestOutcome::Failed {
                result.error_message = Some("assertion failed".to_string());
            }
            handle.record_result(result);
            handle.record_end(&case, outcome);
        }
    }
}

impl TestDiscoverer for FakeAdapter {
    fn name(&self) -> &str {
        "fake"
    }

    fn file_extensions(&self) -> &[&str] {
        &["fake"]
    }

    fn default_executor_uri(&self) -> &str {
        FAKE_URI
    }

    fn discover_tests(
        &self,
        sources: &[String],
        logger: &dyn MessageLogger,
        sink: &dyn DiscoverySink,
    ) -> vstest::Result<()> {
        logger.send_message(TestMessageLevel::Informational, "fake discovery");
        for source in sources {
            for name in &self.tests {
                sink.send_test_case(TestCase::new(name, FAKE_URI, source));
            }
        }
        Ok(())
    }
}

impl TestExecutor for FakeAdapter {
    fn executor_uri(&self) -> &str {
        FAKE_URI
    }

    fn run_tests_from_sources(&self, sources: &[String], handle: &dyn FrameworkHandle) -> vstest::Result<()> {
        let cases = sources
            .iter()
            .flat_map(|s| self.tests.iter().map(move |t| TestCase::new(t, FAKE_URI, s)))
            .collect();
        self.run(cases, handle);
        Ok(())
    }

    fn run_tests(&self, tests: &[TestCase], handle: &dyn FrameworkHandle) -> vstest::Result<()> {
        self.run(tests.to_vec(), handle);
        Ok(())
    }

    fn cancel(&self) {}
}

pub fn fake_registry(tests: Vec<&'static str>) -> AdapterRegistry {
    let adapter = Arc::new(FakeAdapter { tests });
    let mut registry = AdapterRegistry::new();
    registry.add_discoverer(adapter.clone());
    registry.add_executor(adapter);
    registry
}

#[derive(Default)]
pub struct DiscoveryRecorder {
    pub tests: Mutex<Vec<TestCase>>,
    pub complete: Mutex<Option<DiscoveryCompletePayload>>,
    pub messages: Mutex<Vec<(TestMessageLevel, String)>>,
    pub raw: Mutex<Vec<String>>,
}

impl DiscoveryEventsHandler for DiscoveryRecorder {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        self.tests.lock().unwrap().extend(tests);
    }

    fn handle_discovery_complete(&self, mut complete: DiscoveryCompletePayload) {
        if let Some(last) = complete.last_discovered_tests.take() {
            self.tests.lock().unwrap().extend(last);
        }
        *self.complete.lock().unwrap() = Some(complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.messages.lock().unwrap().push((level, message.to_string()));
    }

    fn handle_raw_message(&self, raw: &str) {
        self.raw.lock().unwrap().push(raw.to_string());
    }
}

#[derive(Default)]
pub struct RunRecorder {
    pub changes: Mutex<Vec<TestRunChangedEventArgs>>,
    pub complete: Mutex<Option<TestRunCompletePayload>>,
    pub messages: Mutex<Vec<(TestMessageLevel, String)>>,
}

impl RunRecorder {
    pub fn results_seen(&self) -> usize {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.new_test_results.len())
            .sum()
    }
}

impl RunEventsHandler for RunRecorder {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.changes.lock().unwrap().push(args);
    }

    fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
        *self.complete.lock().unwrap() = Some(complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.messages.lock().unwrap().push((level, message.to_string()));
    }
}

/// Compile `source` as a libtest binary in `dir`. `None` when rustc is not
/// available.
pub fn compile_test_binary(dir: &Path, source: &str) -> Option<PathBuf> {
    let src_path = dir.join("suite.rs");
    std::fs::write(&src_path, source).ok()?;
    let out_path = dir.join("suite");
    let status = Command::new("rustc")
        .args(["--test", "--edition", "2021", "-o"])
        .arg(&out_path)
        .arg(&src_path)
        .status()
        .ok()?;
    status.success().then_some(out_path)
}

pub const SAMPLE_SUITE: &str = r#"
pub fn add(a: i32, b: i32) -> i32 {
    a + b
}

#[cfg(test)]
mod math {
    use super::*;

    #[test]
    fn adds() {
        assert_eq!(add(2, 2), 4);
    }

    #[test]
    fn subtracts_badly() {
        assert_eq!(add(2, -2), 1, "sum was off");
    }

    #[test]
    #[ignore]
    fn slow() {}
}
"#;

/// Passes only when the testhost was launched with the timing
/// datacollector's environment.
pub const COLLECTOR_AWARE_SUITE: &str = r#"
#[cfg(test)]
mod collector {
    #[test]
    fn sees_timing_collector() {
        assert_eq!(std::env::var("VSTEST_DATACOLLECTOR").as_deref(), Ok("timing"));
    }
}
"#;

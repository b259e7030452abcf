use crate::adapter::MessageLogger;
use crate::model::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestRunChangedEventArgs,
    TestRunCompletePayload,
};

/// Receives the progress of one discovery request.
pub trait DiscoveryEventsHandler: Send + Sync {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>);

    /// Raised exactly once per request, after every batch.
    fn handle_discovery_complete(&self, complete: DiscoveryCompletePayload);

    fn handle_log_message(&self, level: TestMessageLevel, message: &str);

    /// Wire text of each message before it is dispatched.
    fn handle_raw_message(&self, _raw: &str) {}
}

/// Receives the progress of one test run.
pub trait RunEventsHandler: Send + Sync {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs);

    /// Raised exactly once per run, after every stats change.
    fn handle_test_run_complete(&self, complete: TestRunCompletePayload);

    fn handle_log_message(&self, level: TestMessageLevel, message: &str);

    fn handle_raw_message(&self, _raw: &str) {}
}

/// Routes adapter log messages to a discovery handler.
pub struct DiscoveryLogger<'a>(pub &'a dyn DiscoveryEventsHandler);

impl MessageLogger for DiscoveryLogger<'_> {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.0.handle_log_message(level, message);
    }
}

/// Routes log messages to a run handler.
pub struct RunLogger<'a>(pub &'a dyn RunEventsHandler);

impl MessageLogger for RunLogger<'_> {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.0.handle_log_message(level, message);
    }
}

use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use super::TestLoggerSink;
use crate::model::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestOutcome, TestResult,
    TestRunCompleteEventArgs,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Human-readable progress on any writer; stdout for the CLI.
pub struct ConsoleLogger<W: Write + Send = std::io::Stdout> {
    out: Mutex<W>,
    verbose: bool,
}

impl ConsoleLogger {
    pub fn stdout(verbose: bool) -> Self {
        Self::new(std::io::stdout(), verbose)
    }
}

impl<W: Write + Send> ConsoleLogger<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self {
            out: Mutex::new(out),
            verbose,
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn line(&self, text: &str) {
        let mut out = lock(&self.out);
        if let Err(e) = writeln!(out, "{}", text) {
            tracing::debug!("Console logger write failed: {}", e);
        }
    }
}

impl<W: Write + Send> TestLoggerSink for ConsoleLogger<W> {
    fn on_test_result(&self, result: &TestResult) {
        let label = match result.outcome {
            TestOutcome::Passed if !self.verbose => return,
            TestOutcome::Passed => "Passed",
            TestOutcome::Failed => "Failed",
            TestOutcome::Skipped => "Skipped",
            TestOutcome::NotFound => "Not found",
            TestOutcome::None => "None",
        };
        let name = result
            .display_name
            .as_deref()
            .unwrap_or(&result.test_case.display_name);
        self.line(&format!("  {} {} [{} ms]", label, name, result.duration_ms));

        if result.outcome == TestOutcome::Failed {
            if let Some(message) = &result.error_message {
                self.line(&format!("    Error Message:\n     {}", message.trim_end()));
            }
            if let Some(stack) = &result.error_stack_trace {
                self.line(&format!("    Stack Trace:\n     {}", stack.trim_end()));
            }
        }
    }

    fn on_message(&self, level: TestMessageLevel, message: &str) {
        match level {
            TestMessageLevel::Informational if !self.verbose => {}
            TestMessageLevel::Informational => self.line(message),
            TestMessageLevel::Warning => self.line(&format!("Warning: {}", message)),
            TestMessageLevel::Error => self.line(&format!("Error: {}", message)),
        }
    }

    fn on_discovered_tests(&self, tests: &[TestCase]) {
        for test in tests {
            self.line(&format!("    {}", test.fully_qualified_name));
        }
    }

    fn on_discovery_complete(&self, complete: &DiscoveryCompletePayload) {
        if complete.is_aborted {
            self.line("Test discovery aborted.");
        } else {
            self.line(&format!("Discovered {} test(s).", complete.total_tests));
        }
    }

    fn on_test_run_complete(&self, complete: &TestRunCompleteEventArgs) {
        let stats = complete.test_run_statistics.clone().unwrap_or_default();
        let failed = stats.count(TestOutcome::Failed);
        let verdict = if complete.is_aborted {
            "Test Run Aborted."
        } else if complete.is_canceled {
            "Test Run Canceled."
        } else if failed > 0 {
            "Failed!"
        } else {
            "Passed!"
        };
        self.line(&format!(
            "{} - Failed: {}, Passed: {}, Skipped: {}, Total: {}, Duration: {} ms",
            verdict,
            failed,
            stats.count(TestOutcome::Passed),
            stats.count(TestOutcome::Skipped),
            stats.executed_tests,
            complete.elapsed_time_ms
        ));
        if let Some(error) = &complete.error {
            self.line(&format!("Error: {}", error));
        }
    }
}

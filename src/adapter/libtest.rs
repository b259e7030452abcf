use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{DiscoverySink, FrameworkHandle, MessageLogger, TestDiscoverer, TestExecutor};
use crate::managed_name::{self, AssemblyMetadata, ManagedName, MethodDefinition, MethodHandle, TypeDefinition};
use crate::model::{TestCase, TestMessageLevel, TestOutcome, TestResult, TestResultMessage};
use crate::{Error, Result};

pub const EXECUTOR_URI: &str = "executor://libtest/v1";

const EXTENSIONS: &[&str] = &["", "exe"];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs Rust test binaries built with the default libtest harness.
pub struct LibtestAdapter {
    running: Mutex<Option<Child>>,
}

impl LibtestAdapter {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    fn run_binary(
        &self,
        source: &str,
        filters: &[String],
        known: &HashMap<String, TestCase>,
        handle: &dyn FrameworkHandle,
    ) -> Result<()> {
        if handle.is_cancelled() {
            return Ok(());
        }

        // --format json is unstable; RUSTC_BOOTSTRAP unlocks it on stable toolchains
        let mut command = Command::new(source);
        command
            .args(["-Zunstable-options", "--format", "json", "--report-time"])
            .env("RUSTC_BOOTSTRAP", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !filters.is_empty() {
            command.arg("--exact").args(filters);
        }

        let mut child = command.spawn().map_err(|e| Error::AdapterFailed {
            adapter: "libtest".to_string(),
            reason: format!("failed to start {}: {}", source, e),
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *lock(&self.running) = Some(child);
        tracing::debug!("Running {} ({} filters)", source, filters.len());

        let stderr_reader = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            text
        });

        let mut in_flight: HashMap<String, (TestCase, DateTime<Utc>)> = HashMap::new();
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match parse_event(&line) {
                    Some(LibtestEvent::Started { name }) => {
                        let case = test_case_for(&name, source, known);
                        handle.record_start(&case);
                        in_flight.insert(name, (case, Utc::now()));
                    }
                    Some(LibtestEvent::Finished {
                        name,
                        outcome,
                        exec_time_ms,
                        stdout,
                    }) => {
                        let (case, started) = in_flight
                            .remove(&name)
                            .unwrap_or_else(|| (test_case_for(&name, source, known), Utc::now()));
                        let mut result = TestResult::new(case, outcome);
                        result.start_time = started;
                        result.end_time = Utc::now();
                        result.duration_ms = exec_time_ms;
                        if outcome == TestOutcome::Failed {
                            let report = match stdout.as_deref() {
                                Some(out) => PanicReport::from_output(out),
                                None => PanicReport {
                                    message: format!("Test '{}' timed out", name),
                                    location: None,
                                },
                            };
                            result.error_stack_trace = report.stack_trace();
                            result.error_message = Some(report.message);
                        }
                        if let Some(out) = stdout.filter(|s| !s.is_empty()) {
                            result.messages.push(TestResultMessage {
                                category: TestResultMessage::STANDARD_OUT.to_string(),
                                text: out,
                            });
                        }
                        let case = result.test_case.clone();
                        handle.record_result(result);
                        handle.record_end(&case, outcome);
                    }
                    None => {}
                }
            }
        }

        let status = lock(&self.running).take().map(|mut c| c.wait());
        let stderr_text = stderr_reader.join().unwrap_or_default();

        // A crash leaves started tests without a result
        if !in_flight.is_empty() && !handle.is_cancelled() {
            let exit = match status {
                Some(Ok(s)) => describe_exit(s.code(), exit_signal(&s)),
                Some(Err(e)) => format!("could not be waited on: {}", e),
                None => "was lost".to_string(),
            };
            for (_, (case, started)) in in_flight {
                let mut result = TestResult::new(case, TestOutcome::Failed);
                result.start_time = started;
                result.error_message = Some(format!("Test process {} while this test was running", exit));
                if !stderr_text.is_empty() {
                    result.messages.push(TestResultMessage {
                        category: TestResultMessage::STANDARD_ERROR.to_string(),
                        text: stderr_text.clone(),
                    });
                }
                let case = result.test_case.clone();
                handle.record_result(result);
                handle.record_end(&case, TestOutcome::Failed);
            }
        }
        Ok(())
    }
}

impl Default for LibtestAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDiscoverer for LibtestAdapter {
    fn name(&self) -> &str {
        "libtest"
    }

    fn file_extensions(&self) -> &[&str] {
        EXTENSIONS
    }

    fn default_executor_uri(&self) -> &str {
        EXECUTOR_URI
    }

    fn discover_tests(
        &self,
        sources: &[String],
        logger: &dyn MessageLogger,
        sink: &dyn DiscoverySink,
    ) -> Result<()> {
        for source in sources {
            let output = match Command::new(source)
                .args(["--list", "--format", "terse"])
                .stderr(Stdio::piped())
                .output()
            {
                Ok(output) => output,
                Err(e) => {
                    logger.send_message(
                        TestMessageLevel::Warning,
                        &format!("Could not list tests in {}: {}", source, e),
                    );
                    continue;
                }
            };
            if !output.status.success() {
                logger.send_message(
                    TestMessageLevel::Warning,
                    &format!(
                        "{} --list exited with {}: {}",
                        source,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                );
                continue;
            }
            for case in parse_test_list(&String::from_utf8_lossy(&output.stdout), source) {
                sink.send_test_case(case);
            }
        }
        Ok(())
    }
}

impl TestExecutor for LibtestAdapter {
    fn executor_uri(&self) -> &str {
        EXECUTOR_URI
    }

    fn run_tests_from_sources(&self, sources: &[String], handle: &dyn FrameworkHandle) -> Result<()> {
        let known = HashMap::new();
        for source in sources {
            self.run_binary(source, &[], &known, handle)?;
        }
        Ok(())
    }

    fn run_tests(&self, tests: &[TestCase], handle: &dyn FrameworkHandle) -> Result<()> {
        let mut by_source: Vec<(String, HashMap<String, TestCase>)> = Vec::new();
        for test in tests {
            match by_source.iter_mut().find(|(s, _)| *s == test.source) {
                Some((_, known)) => {
                    known.insert(test.fully_qualified_name.clone(), test.clone());
                }
                None => by_source.push((
                    test.source.clone(),
                    HashMap::from([(test.fully_qualified_name.clone(), test.clone())]),
                )),
            }
        }
        for (source, known) in by_source {
            let filters: Vec<String> = known.keys().cloned().collect();
            self.run_binary(&source, &filters, &known, handle)?;
        }
        Ok(())
    }

    fn cancel(&self) {
        if let Some(child) = lock(&self.running).as_mut() {
            tracing::info!("Killing test process {}", child.id());
            let _ = child.kill();
        }
    }
}

fn test_case_for(name: &str, source: &str, known: &HashMap<String, TestCase>) -> TestCase {
    known.get(name).cloned().unwrap_or_else(|| build_test_case(name, source))
}

fn build_test_case(name: &str, source: &str) -> TestCase {
    let case = TestCase::new(name, EXECUTOR_URI, source);
    match managed_identity(name, source) {
        Some(managed) => case.with_managed_name(&managed),
        None => case,
    }
}

/// Parse `--list --format terse` output: one `name: test` line per test.
/// Benchmarks are not tests.
pub fn parse_test_list(stdout: &str, source: &str) -> Vec<TestCase> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_suffix(": test"))
        .filter(|name| !name.is_empty())
        .map(|name| build_test_case(name, source))
        .collect()
}

/// Map a test path `a::b::tests::adds` onto namespace `a.b`, class `tests`
/// and method `adds`. Top-level tests are placed on a class named after the
/// binary.
pub fn managed_identity(name: &str, source: &str) -> Option<ManagedName> {
    let parts: Vec<&str> = name.split("::").collect();
    let (method, class, namespace) = match parts.as_slice() {
        [] => return None,
        [method] => (*method, binary_name(source), None),
        [namespace @ .., class, method] => (
            *method,
            class.to_string(),
            Some(namespace.join(".")).filter(|ns| !ns.is_empty()),
        ),
    };

    let mut assembly = AssemblyMetadata::new(&binary_name(source));
    let type_id = assembly.add_type(
        TypeDefinition::new(namespace.as_deref(), &class).with_method(MethodDefinition::new(method)),
    );
    match managed_name::get_managed_name(&assembly, &MethodHandle::new(type_id, 0)) {
        Ok(managed) => Some(managed),
        Err(e) => {
            tracing::debug!("No managed name for {}: {}", name, e);
            None
        }
    }
}

/// Binary file name without the cargo hash suffix.
fn binary_name(source: &str) -> String {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(source);
    match stem.rsplit_once('-') {
        Some((base, hash)) if !base.is_empty() && hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            base.to_string()
        }
        _ => stem.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LibtestEvent {
    Started {
        name: String,
    },
    Finished {
        name: String,
        outcome: TestOutcome,
        exec_time_ms: u64,
        stdout: Option<String>,
    },
}

/// Parse one line of libtest JSON output. Suite events and non-JSON lines
/// yield `None`.
pub fn parse_event(line: &str) -> Option<LibtestEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let v: serde_json::Value = serde_json::from_str(line).ok()?;
    if v.get("type").and_then(|t| t.as_str()) != Some("test") {
        return None;
    }
    let name = v.get("name").and_then(|n| n.as_str())?.to_string();
    let exec_time_ms = v
        .get("exec_time")
        .and_then(|t| t.as_f64())
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0);
    let stdout = v.get("stdout").and_then(|s| s.as_str()).map(String::from);

    let outcome = match v.get("event").and_then(|e| e.as_str()).unwrap_or("") {
        "started" => return Some(LibtestEvent::Started { name }),
        "ok" => TestOutcome::Passed,
        "failed" => TestOutcome::Failed,
        "timeout" => {
            return Some(LibtestEvent::Finished {
                name,
                outcome: TestOutcome::Failed,
                exec_time_ms,
                stdout: None,
            })
        }
        "ignored" => TestOutcome::Skipped,
        _ => return None,
    };
    Some(LibtestEvent::Finished {
        name,
        outcome,
        exec_time_ms,
        stdout,
    })
}

/// Failure details recovered from a failing test's captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    pub message: String,
    /// File and line of the panic site.
    pub location: Option<(String, u32)>,
}

impl PanicReport {
    const MARKER: &'static str = "panicked at ";
    const BACKTRACE_NOTE: &'static str = "note: run with `RUST_BACKTRACE";

    /// Reads the first panic in `output`. Understands the current layout,
    /// `panicked at file:line:col:` followed by the message, and the older
    /// `panicked at 'message', file:line:col`. Output without a panic is
    /// kept whole as the message.
    pub fn from_output(output: &str) -> Self {
        let Some(at) = output.find(Self::MARKER) else {
            return Self {
                message: output.trim().to_string(),
                location: None,
            };
        };
        let body: Vec<&str> = output[at + Self::MARKER.len()..]
            .lines()
            .filter(|l| !l.starts_with(Self::BACKTRACE_NOTE))
            .collect();
        let body = body.join("\n");

        let (message, site) = match body.strip_prefix('\'') {
            Some(quoted) => match quoted.rsplit_once("', ") {
                Some((message, rest)) => (message, rest.lines().next().unwrap_or_default()),
                None => (quoted, ""),
            },
            None => {
                let (site, message) = body.split_once('\n').unwrap_or((body.as_str(), ""));
                (message, site.trim_end_matches(':'))
            }
        };
        let message = message.trim();
        Self {
            message: if message.is_empty() {
                output.trim().to_string()
            } else {
                message.to_string()
            },
            location: parse_site(site),
        }
    }

    pub fn stack_trace(&self) -> Option<String> {
        self.location
            .as_ref()
            .map(|(file, line)| format!("at {}:{}", file, line))
    }
}

/// `file:line` or `file:line:col`.
fn parse_site(site: &str) -> Option<(String, u32)> {
    let mut parts = site.trim().rsplitn(3, ':');
    let last = parts.next()?;
    let previous = parts.next()?;
    match (parts.next(), previous.parse::<u32>(), last.parse::<u32>()) {
        (Some(file), Ok(line), Ok(_column)) => Some((file.to_string(), line)),
        (None, _, Ok(line)) => Some((previous.to_string(), line)),
        _ => None,
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    if let Some(signal) = signal {
        let signal_name = match signal {
            6 => "SIGABRT",
            9 => "SIGKILL",
            11 => "SIGSEGV",
            15 => "SIGTERM",
            _ => "signal",
        };
        return format!("crashed with {} (signal {})", signal_name, signal);
    }
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "exited abnormally".to_string(),
    }
}

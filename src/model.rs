//! Test objects and protocol payloads exchanged between the orchestrator,
//! testhost and datacollector.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::managed_name::{hierarchy, ManagedName};

/// Namespace for deterministic test ids.
const TEST_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5b1e_0c2d_8f3a_4e61_9a7b_2c4d_6e8f_0a1b);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub executor_uri: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_method: Option<String>,
    #[serde(default)]
    pub hierarchy: [Option<String>; hierarchy::TOTAL_LEVELS],
}

impl TestCase {
    pub fn new(fully_qualified_name: &str, executor_uri: &str, source: &str) -> Self {
        Self {
            id: test_id(source, fully_qualified_name),
            fully_qualified_name: fully_qualified_name.to_string(),
            display_name: fully_qualified_name.to_string(),
            executor_uri: executor_uri.to_string(),
            source: source.to_string(),
            code_file_path: None,
            line_number: None,
            managed_type: None,
            managed_method: None,
            hierarchy: Default::default(),
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }

    pub fn with_location(mut self, file: &str, line: u32) -> Self {
        self.code_file_path = Some(file.to_string());
        self.line_number = Some(line);
        self
    }

    pub fn with_managed_name(mut self, name: &ManagedName) -> Self {
        self.managed_type = Some(name.managed_type_name.clone());
        self.managed_method = Some(name.managed_method_name.clone());
        self.hierarchy = name.hierarchy.clone();
        self
    }

    /// A test case needs a name and a source to be addressable.
    pub fn is_valid(&self) -> bool {
        !self.fully_qualified_name.is_empty() && !self.source.is_empty()
    }
}

/// Stable id of a test within its source.
pub fn test_id(source: &str, fully_qualified_name: &str) -> Uuid {
    Uuid::new_v5(
        &TEST_ID_NAMESPACE,
        format!("{}:{}", source, fully_qualified_name).as_bytes(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TestOutcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResultMessage {
    pub category: String,
    pub text: String,
}

impl TestResultMessage {
    pub const STANDARD_OUT: &'static str = "StdOutMsgs";
    pub const STANDARD_ERROR: &'static str = "StdErrMsgs";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub duration_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<TestResultMessage>,
}

impl TestResult {
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            test_case,
            outcome,
            error_message: None,
            error_stack_trace: None,
            display_name: None,
            duration_ms: 0,
            start_time: now,
            end_time: now,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunStatistics {
    pub executed_tests: u64,
    pub stats: BTreeMap<TestOutcome, u64>,
}

impl TestRunStatistics {
    pub fn record(&mut self, outcome: TestOutcome) {
        self.executed_tests += 1;
        *self.stats.entry(outcome).or_insert(0) += 1;
    }

    pub fn count(&self, outcome: TestOutcome) -> u64 {
        self.stats.get(&outcome).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMessageLevel {
    Informational,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestMessagePayload {
    pub message_level: TestMessageLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCriteria {
    pub sources: Vec<String>,
    pub frequency_of_discovered_test_events: usize,
    pub discovered_test_event_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_filter: Option<String>,
}

impl DiscoveryCriteria {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            frequency_of_discovered_test_events: 1_000,
            discovered_test_event_timeout_ms: 1_500,
            test_case_filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestCase>>,
    pub frequency_of_run_stats_change_event: usize,
    pub run_stats_change_event_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_filter: Option<String>,
}

impl TestRunCriteria {
    pub fn with_sources(sources: Vec<String>) -> Self {
        Self {
            sources: Some(sources),
            tests: None,
            frequency_of_run_stats_change_event: 100,
            run_stats_change_event_timeout_ms: 1_000,
            test_case_filter: None,
        }
    }

    pub fn with_tests(tests: Vec<TestCase>) -> Self {
        Self {
            sources: None,
            tests: Some(tests),
            ..Self::with_sources(Vec::new())
        }
    }

    pub fn has_specific_tests(&self) -> bool {
        self.tests.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompletePayload {
    /// -1 when discovery was aborted.
    pub total_tests: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_discovered_tests: Option<Vec<TestCase>>,
    pub is_aborted: bool,
}

impl DiscoveryCompletePayload {
    pub fn aborted() -> Self {
        Self {
            total_tests: -1,
            last_discovered_tests: None,
            is_aborted: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunChangedEventArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_statistics: Option<TestRunStatistics>,
    #[serde(default)]
    pub new_test_results: Vec<TestResult>,
    #[serde(default)]
    pub active_tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UriDataAttachment {
    pub uri: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    #[serde(default)]
    pub attachments: Vec<UriDataAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompleteEventArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_statistics: Option<TestRunStatistics>,
    pub is_canceled: bool,
    pub is_aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_time_ms: u64,
    #[serde(default)]
    pub attachment_sets: Vec<AttachmentSet>,
}

impl TestRunCompleteEventArgs {
    pub fn aborted(error: Option<String>) -> Self {
        Self {
            is_aborted: true,
            error,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompletePayload {
    pub test_run_complete_args: TestRunCompleteEventArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_tests: Option<TestRunChangedEventArgs>,
    #[serde(default)]
    pub run_attachments: Vec<AttachmentSet>,
    #[serde(default)]
    pub executor_uris: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BeforeTestRunStartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BeforeTestRunStartResult {
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    pub data_collection_events_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AfterTestRunEndResult {
    #[serde(default)]
    pub attachment_sets: Vec<AttachmentSet>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestHostLaunchedPayload {
    pub process_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic_per_source() {
        let a = TestCase::new("tests::adds", "executor://libtest", "/bin/a");
        let b = TestCase::new("tests::adds", "executor://libtest", "/bin/a");
        let c = TestCase::new("tests::adds", "executor://libtest", "/bin/c");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_validity_requires_name_and_source() {
        assert!(TestCase::new("t", "e", "s").is_valid());
        assert!(!TestCase::new("", "e", "s").is_valid());
        assert!(!TestCase::new("t", "e", "").is_valid());
    }

    #[test]
    fn test_statistics_count_by_outcome() {
        let mut stats = TestRunStatistics::default();
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Failed);
        assert_eq!(stats.executed_tests, 3);
        assert_eq!(stats.count(TestOutcome::Passed), 2);
        assert_eq!(stats.count(TestOutcome::Skipped), 0);
    }

    #[test]
    fn test_statistics_serialize_with_outcome_keys() {
        let mut stats = TestRunStatistics::default();
        stats.record(TestOutcome::Skipped);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["Stats"]["Skipped"], 1);
        let back: TestRunStatistics = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn test_test_case_wire_names_are_pascal_case() {
        let case = TestCase::new("tests::adds", "executor://libtest", "/bin/a").with_location("src/lib.rs", 12);
        let json = serde_json::to_value(&case).unwrap();
        assert_eq!(json["FullyQualifiedName"], "tests::adds");
        assert_eq!(json["LineNumber"], 12);
        assert!(json.get("ManagedType").is_none());
    }
}

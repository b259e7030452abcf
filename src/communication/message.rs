use serde_json::Value;

/// Highest protocol version this build speaks.
pub const HIGHEST_SUPPORTED_VERSION: i32 = 7;

/// Versions at or below this are written without a `Version` field.
pub const UNVERSIONED_MAX: i32 = 1;

/// Stable opcode strings carried in `MessageType`.
pub mod message_type {
    pub const VERSION_CHECK: &str = "ProtocolVersion";

    pub const SESSION_MESSAGE: &str = "TestSession.Message";
    pub const SESSION_END: &str = "TestSession.Terminate";

    pub const DISCOVERY_INITIALIZE: &str = "TestDiscovery.Initialize";
    pub const START_DISCOVERY: &str = "TestDiscovery.Start";
    pub const TEST_CASES_FOUND: &str = "TestDiscovery.TestFound";
    pub const DISCOVERY_COMPLETE: &str = "TestDiscovery.Completed";

    pub const EXECUTION_INITIALIZE: &str = "TestExecution.Initialize";
    pub const START_TEST_EXECUTION_WITH_SOURCES: &str = "TestExecution.StartWithSources";
    pub const START_TEST_EXECUTION_WITH_TESTS: &str = "TestExecution.StartWithTests";
    pub const TEST_RUN_STATS_CHANGE: &str = "TestExecution.StatsChange";
    pub const EXECUTION_COMPLETE: &str = "TestExecution.Completed";
    pub const CANCEL_TEST_RUN: &str = "TestExecution.Cancel";
    pub const ABORT_TEST_RUN: &str = "TestExecution.Abort";

    pub const BEFORE_TEST_RUN_START: &str = "DataCollection.BeforeTestRunStart";
    pub const BEFORE_TEST_RUN_START_RESULT: &str = "DataCollection.BeforeTestRunStartResult";
    pub const AFTER_TEST_RUN_END: &str = "DataCollection.AfterTestRunEnd";
    pub const AFTER_TEST_RUN_END_RESULT: &str = "DataCollection.AfterTestRunEndResult";
    pub const TEST_HOST_LAUNCHED: &str = "DataCollection.TestHostLaunched";
}

/// One logical exchange on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: String,
    pub payload: Option<Value>,
    /// 0 when the sender did not write a version.
    pub version: i32,
}

impl Message {
    pub fn new(message_type: &str, payload: Option<Value>, version: i32) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
            version,
        }
    }

    pub fn is(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }
}

/// Per-call overrides for versioning and addressing; also what a payload
/// arrived with when read through `deserialize_payload_with_metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub version: Option<i32>,
    pub recipient: Option<String>,
    pub message_type: Option<String>,
}

impl MessageMetadata {
    pub fn with_version(version: i32) -> Self {
        Self {
            version: Some(version),
            ..Default::default()
        }
    }
}

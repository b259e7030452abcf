use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::adapter::MessageLogger;
use crate::communication::{message_type, CommunicationManager, MessageMetadata, TransportKind};
use crate::model::{
    AfterTestRunEndResult, BeforeTestRunStartPayload, BeforeTestRunStartResult, TestHostLaunchedPayload,
    TestMessagePayload,
};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hooks a datacollector process runs around a test run.
pub trait DataCollector: Send + Sync {
    fn before_test_run_start(&self, payload: &BeforeTestRunStartPayload) -> BeforeTestRunStartResult;

    fn test_host_launched(&self, process_id: u32);

    fn after_test_run_end(&self, is_cancelled: bool) -> AfterTestRunEndResult;
}

/// Orchestrator side of the datacollector protocol.
pub struct DataCollectionRequestSender {
    communication: CommunicationManager,
    cancel: CancellationToken,
}

impl DataCollectionRequestSender {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            communication: CommunicationManager::new(transport),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind an endpoint for the datacollector; returns its address.
    pub async fn initialize_communication(&self) -> Result<String> {
        let endpoint = self.communication.transport().default_endpoint();
        self.communication.host_server(&endpoint).await
    }

    pub async fn wait_for_request_handler_connection(&self, timeout: Duration) -> bool {
        self.communication.wait_for_client_connection(timeout).await
    }

    pub async fn send_before_test_run_start_and_get_result(
        &self,
        payload: &BeforeTestRunStartPayload,
        logger: &dyn MessageLogger,
    ) -> Result<BeforeTestRunStartResult> {
        self.communication.send_message_with_metadata(
            message_type::BEFORE_TEST_RUN_START,
            payload,
            &MessageMetadata::default(),
        )?;
        self.wait_for_reply(message_type::BEFORE_TEST_RUN_START_RESULT, logger).await
    }

    pub fn send_test_host_launched(&self, process_id: u32) -> Result<()> {
        self.communication.send_message_with_metadata(
            message_type::TEST_HOST_LAUNCHED,
            &TestHostLaunchedPayload { process_id },
            &MessageMetadata::default(),
        )
    }

    pub async fn send_after_test_run_end_and_get_result(
        &self,
        is_cancelled: bool,
        logger: &dyn MessageLogger,
    ) -> Result<AfterTestRunEndResult> {
        self.communication.send_message_with_metadata(
            message_type::AFTER_TEST_RUN_END,
            &is_cancelled,
            &MessageMetadata::default(),
        )?;
        self.wait_for_reply(message_type::AFTER_TEST_RUN_END_RESULT, logger).await
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.communication.stop_server();
    }

    /// Relay session messages to `logger` until `expected` arrives.
    async fn wait_for_reply<T: DeserializeOwned>(&self, expected: &str, logger: &dyn MessageLogger) -> Result<T> {
        loop {
            let message = self
                .communication
                .receive_message_async(&self.cancel)
                .await?
                .ok_or_else(|| Error::ConnectionClosed(format!("Datacollector closed before '{}'.", expected)))?;
            if message.is(expected) {
                return self.communication.deserialize_payload(&message);
            }
            if message.is(message_type::SESSION_MESSAGE) {
                let payload: TestMessagePayload = self.communication.deserialize_payload(&message)?;
                logger.send_message(payload.message_level, &payload.message);
                continue;
            }
            tracing::warn!("Ignoring '{}' while waiting for '{}'", message.message_type, expected);
        }
    }
}

/// Datacollector side: answers the orchestrator's run hooks.
pub struct DataCollectionRequestHandler {
    communication: CommunicationManager,
    cancel: CancellationToken,
}

impl DataCollectionRequestHandler {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            communication: CommunicationManager::new(transport),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn initialize_communication(&self, endpoint: &str) -> Result<()> {
        self.communication.setup_client_async(endpoint).await
    }

    pub async fn wait_for_request_sender_connection(&self, timeout: Duration) -> bool {
        self.communication.wait_for_server_connection(timeout).await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve requests until the after-run reply has been sent or the
    /// orchestrator disconnects.
    pub async fn process_requests(&self, collector: &dyn DataCollector) -> Result<()> {
        let outcome = self.serve(collector).await;
        self.communication.stop_client();
        outcome
    }

    async fn serve(&self, collector: &dyn DataCollector) -> Result<()> {
        loop {
            let message = match self.communication.receive_message_async(&self.cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::warn!("Orchestrator closed the datacollector connection");
                    return Ok(());
                }
                Err(Error::Cancelled(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            match message.message_type.as_str() {
                message_type::BEFORE_TEST_RUN_START => {
                    let payload: BeforeTestRunStartPayload = self.communication.deserialize_payload(&message)?;
                    let result = collector.before_test_run_start(&payload);
                    self.communication.send_message_with_metadata(
                        message_type::BEFORE_TEST_RUN_START_RESULT,
                        &result,
                        &MessageMetadata::with_version(message.version),
                    )?;
                }
                message_type::TEST_HOST_LAUNCHED => {
                    let payload: TestHostLaunchedPayload = self.communication.deserialize_payload(&message)?;
                    collector.test_host_launched(payload.process_id);
                }
                message_type::AFTER_TEST_RUN_END => {
                    let is_cancelled: bool = self.communication.deserialize_payload(&message)?;
                    let result = collector.after_test_run_end(is_cancelled);
                    self.communication.send_message_with_metadata(
                        message_type::AFTER_TEST_RUN_END_RESULT,
                        &result,
                        &MessageMetadata::with_version(message.version),
                    )?;
                    tracing::info!("Run ended, datacollector done");
                    return Ok(());
                }
                other => tracing::warn!("Datacollector ignoring '{}'", other),
            }
        }
    }
}

/// Built-in collector: records run timing and the testhost process id.
#[derive(Default)]
pub struct TimingCollector {
    started: Mutex<Option<Instant>>,
    test_host: Mutex<Option<u32>>,
}

pub const RUN_DURATION_METRIC: &str = "DataCollector.RunDurationMs";
pub const TEST_HOST_PROCESS_METRIC: &str = "DataCollector.TestHostProcessId";
pub const COLLECTOR_ENV: &str = "VSTEST_DATACOLLECTOR";

impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataCollector for TimingCollector {
    fn before_test_run_start(&self, payload: &BeforeTestRunStartPayload) -> BeforeTestRunStartResult {
        tracing::info!("Run starting over {} source(s)", payload.sources.len());
        *lock(&self.started) = Some(Instant::now());
        BeforeTestRunStartResult {
            environment_variables: BTreeMap::from([(COLLECTOR_ENV.to_string(), "timing".to_string())]),
            data_collection_events_port: 0,
        }
    }

    fn test_host_launched(&self, process_id: u32) {
        tracing::info!("Testhost launched with pid {}", process_id);
        *lock(&self.test_host) = Some(process_id);
    }

    fn after_test_run_end(&self, is_cancelled: bool) -> AfterTestRunEndResult {
        let mut metrics = BTreeMap::new();
        if let Some(started) = *lock(&self.started) {
            metrics.insert(
                RUN_DURATION_METRIC.to_string(),
                serde_json::Value::from(started.elapsed().as_millis() as u64),
            );
        }
        if let Some(pid) = *lock(&self.test_host) {
            metrics.insert(TEST_HOST_PROCESS_METRIC.to_string(), serde_json::Value::from(pid));
        }
        metrics.insert("DataCollector.RunCancelled".to_string(), serde_json::Value::from(is_cancelled));
        AfterTestRunEndResult {
            attachment_sets: Vec::new(),
            metrics,
        }
    }
}

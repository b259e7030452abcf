use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::events::{DiscoveryEventsHandler, RunEventsHandler};
use crate::communication::{
    message_type, CommunicationManager, Message, MessageMetadata, TestHostConnectionInfo,
    HIGHEST_SUPPORTED_VERSION,
};
use crate::model::{
    DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestMessageLevel, TestMessagePayload,
    TestRunChangedEventArgs, TestRunCompleteEventArgs, TestRunCompletePayload, TestRunCriteria,
};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Orchestrator side of the testhost protocol: hosts the endpoint, sends
/// requests and dispatches the testhost's replies to event handlers.
pub struct TestRequestSender {
    communication: CommunicationManager,
    connection_info: TestHostConnectionInfo,
    connection_timeout: Duration,
    /// Cancelled once the testhost process is known to have exited.
    client_exited: CancellationToken,
    client_exit_error: Mutex<Option<String>>,
}

impl TestRequestSender {
    pub fn new(connection_info: TestHostConnectionInfo, connection_timeout: Duration) -> Self {
        Self {
            communication: CommunicationManager::new(connection_info.transport),
            connection_info,
            connection_timeout,
            client_exited: CancellationToken::new(),
            client_exit_error: Mutex::new(None),
        }
    }

    /// Bind the endpoint the testhost will connect to; returns its address.
    pub async fn initialize_communication(&self) -> Result<String> {
        let bound = self.communication.host_server(&self.connection_info.endpoint).await?;
        tracing::info!("Waiting for testhost on {}", bound);
        Ok(bound)
    }

    /// `false` when the timeout elapses, `cancel` fires or the testhost
    /// exits before connecting.
    pub async fn wait_for_request_handler_connection(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            connected = self.communication.wait_for_client_connection(timeout) => connected,
            _ = cancel.cancelled() => {
                tracing::info!("Stopped waiting for testhost: cancelled");
                false
            }
            _ = self.client_exited.cancelled() => {
                tracing::warn!("Testhost exited before connecting");
                false
            }
        }
    }

    /// Offer the highest supported version and adopt the testhost's reply.
    pub async fn check_version_with_test_host(&self) -> Result<i32> {
        self.communication.send_message_with_metadata(
            message_type::VERSION_CHECK,
            &HIGHEST_SUPPORTED_VERSION,
            &MessageMetadata::with_version(0),
        )?;

        let reply = tokio::time::timeout(self.connection_timeout, async {
            loop {
                let message = self
                    .communication
                    .receive_message_async(&self.client_exited)
                    .await?
                    .ok_or_else(|| Error::ConnectionClosed("Testhost closed during version check.".to_string()))?;
                if message.is(message_type::SESSION_MESSAGE) {
                    let payload: TestMessagePayload = self.communication.deserialize_payload(&message)?;
                    tracing::debug!("Testhost: {}", payload.message);
                    continue;
                }
                return Ok::<Message, Error>(message);
            }
        })
        .await
        .map_err(|_| Error::ConnectionTimeout(self.connection_timeout.as_millis() as u64))??;

        if !reply.is(message_type::VERSION_CHECK) {
            return Err(Error::VersionCheckFailed(format!(
                "Unexpected message '{}' in reply to version check.",
                reply.message_type
            )));
        }
        let version: i32 = self.communication.deserialize_payload(&reply)?;
        if !(0..=HIGHEST_SUPPORTED_VERSION).contains(&version) {
            return Err(Error::VersionCheckFailed(format!("Testhost replied with unsupported version {}.", version)));
        }
        self.communication.set_default_version(version);
        tracing::info!("Negotiated protocol version {}", version);
        Ok(version)
    }

    pub fn protocol_version(&self) -> i32 {
        self.communication.default_version()
    }

    pub fn initialize_discovery(&self, extension_paths: &[String]) -> Result<()> {
        self.send(message_type::DISCOVERY_INITIALIZE, extension_paths)
    }

    pub fn initialize_execution(&self, extension_paths: &[String]) -> Result<()> {
        self.send(message_type::EXECUTION_INITIALIZE, extension_paths)
    }

    /// Start discovery and dispatch replies until it completes.
    ///
    /// If the testhost goes away first, `handler` gets an error message and
    /// an aborted completion.
    pub async fn discover_tests(&self, criteria: &DiscoveryCriteria, handler: &dyn DiscoveryEventsHandler) {
        if let Err(e) = self.send(message_type::START_DISCOVERY, criteria) {
            self.on_discovery_aborted(handler, Some(e.to_string()));
            return;
        }

        loop {
            let message = match self.next_message().await {
                Ok(Some((raw, message))) => {
                    handler.handle_raw_message(&raw);
                    message
                }
                Ok(None) => return self.on_discovery_aborted(handler, None),
                Err(e) => return self.on_discovery_aborted(handler, Some(e.to_string())),
            };

            let dispatched = match message.message_type.as_str() {
                message_type::TEST_CASES_FOUND => self
                    .communication
                    .deserialize_payload::<Vec<TestCase>>(&message)
                    .map(|tests| handler.handle_discovered_tests(tests)),
                message_type::DISCOVERY_COMPLETE => {
                    match self.communication.deserialize_payload::<DiscoveryCompletePayload>(&message) {
                        Ok(complete) => {
                            handler.handle_discovery_complete(complete);
                            return;
                        }
                        Err(e) => Err(e),
                    }
                }
                message_type::SESSION_MESSAGE => self
                    .communication
                    .deserialize_payload::<TestMessagePayload>(&message)
                    .map(|m| handler.handle_log_message(m.message_level, &m.message)),
                other => {
                    tracing::warn!("Ignoring unexpected message '{}' during discovery", other);
                    Ok(())
                }
            };
            if let Err(e) = dispatched {
                return self.on_discovery_aborted(handler, Some(e.to_string()));
            }
        }
    }

    /// Start a run and dispatch replies until it completes.
    pub async fn start_test_run(&self, criteria: &TestRunCriteria, handler: &dyn RunEventsHandler) {
        let request = if criteria.has_specific_tests() {
            message_type::START_TEST_EXECUTION_WITH_TESTS
        } else {
            message_type::START_TEST_EXECUTION_WITH_SOURCES
        };
        if let Err(e) = self.send(request, criteria) {
            self.on_test_run_aborted(handler, Some(e.to_string()));
            return;
        }

        loop {
            let message = match self.next_message().await {
                Ok(Some((raw, message))) => {
                    handler.handle_raw_message(&raw);
                    message
                }
                Ok(None) => return self.on_test_run_aborted(handler, None),
                Err(e) => return self.on_test_run_aborted(handler, Some(e.to_string())),
            };

            let dispatched = match message.message_type.as_str() {
                message_type::TEST_RUN_STATS_CHANGE => self
                    .communication
                    .deserialize_payload::<TestRunChangedEventArgs>(&message)
                    .map(|args| handler.handle_test_run_stats_change(args)),
                message_type::EXECUTION_COMPLETE => {
                    match self.communication.deserialize_payload::<TestRunCompletePayload>(&message) {
                        Ok(complete) => {
                            handler.handle_test_run_complete(complete);
                            return;
                        }
                        Err(e) => Err(e),
                    }
                }
                message_type::SESSION_MESSAGE => self
                    .communication
                    .deserialize_payload::<TestMessagePayload>(&message)
                    .map(|m| handler.handle_log_message(m.message_level, &m.message)),
                other => {
                    tracing::warn!("Ignoring unexpected message '{}' during test run", other);
                    Ok(())
                }
            };
            if let Err(e) = dispatched {
                return self.on_test_run_aborted(handler, Some(e.to_string()));
            }
        }
    }

    pub fn send_test_run_cancel(&self) -> Result<()> {
        tracing::info!("Sending test run cancel");
        self.communication.send_message(message_type::CANCEL_TEST_RUN)
    }

    pub fn send_test_run_abort(&self) -> Result<()> {
        tracing::info!("Sending test run abort");
        self.communication.send_message(message_type::ABORT_TEST_RUN)
    }

    /// Ask the testhost to shut down. A no-op once it has exited.
    pub fn end_session(&self) {
        if self.client_exited.is_cancelled() {
            return;
        }
        self.communication.mark_completing();
        if let Err(e) = self.communication.send_message(message_type::SESSION_END) {
            tracing::debug!("Could not send session end: {}", e);
        }
    }

    /// Record that the testhost process exited; pending waits and receives
    /// end and report `stderr` as the reason.
    pub fn on_client_process_exit(&self, stderr: &str) {
        tracing::info!("Testhost process exited");
        *lock(&self.client_exit_error) = Some(stderr.trim().to_string());
        self.client_exited.cancel();
    }

    pub fn has_client_exited(&self) -> bool {
        self.client_exited.is_cancelled()
    }

    /// Testhost stderr captured when it exited.
    pub fn client_exit_error(&self) -> Option<String> {
        lock(&self.client_exit_error).clone()
    }

    pub fn close(&self) {
        self.communication.stop_server();
    }

    fn send<T: Serialize + ?Sized>(&self, message_type: &str, payload: &T) -> Result<()> {
        self.communication
            .send_message_with_metadata(message_type, payload, &MessageMetadata::default())
    }

    async fn next_message(&self) -> Result<Option<(String, Message)>> {
        match self.communication.receive_raw_message_async(&self.client_exited).await? {
            Some(raw) => {
                let message = self.communication.serializer().deserialize_message(&raw)?;
                Ok(Some((raw, message)))
            }
            None => Ok(None),
        }
    }

    /// Why the testhost is gone, for the error reported to handlers.
    fn abort_reason(&self, error: Option<String>) -> String {
        let stderr = lock(&self.client_exit_error).clone().filter(|s| !s.is_empty());
        match (stderr, error) {
            (Some(stderr), _) => format!("Testhost process exited with error: {}", stderr),
            (None, Some(error)) if self.client_exited.is_cancelled() => {
                tracing::debug!("Receive ended after testhost exit: {}", error);
                "Testhost process exited.".to_string()
            }
            (None, Some(error)) => format!("Lost connection to testhost: {}", error),
            (None, None) => "Testhost closed the connection.".to_string(),
        }
    }

    fn on_discovery_aborted(&self, handler: &dyn DiscoveryEventsHandler, error: Option<String>) {
        let reason = self.abort_reason(error);
        tracing::error!("Discovery aborted: {}", reason);
        handler.handle_log_message(TestMessageLevel::Error, &reason);
        handler.handle_discovery_complete(DiscoveryCompletePayload::aborted());
    }

    fn on_test_run_aborted(&self, handler: &dyn RunEventsHandler, error: Option<String>) {
        let reason = self.abort_reason(error);
        tracing::error!("Test run aborted: {}", reason);
        handler.handle_log_message(TestMessageLevel::Error, &reason);
        handler.handle_test_run_complete(TestRunCompletePayload {
            test_run_complete_args: TestRunCompleteEventArgs::aborted(Some(reason)),
            ..Default::default()
        });
    }
}

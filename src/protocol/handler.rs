use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::events::{DiscoveryEventsHandler, RunEventsHandler};
use crate::adapter::AdapterRegistry;
use crate::communication::{
    message_type, CommunicationManager, ConnectionRole, Message, MessageMetadata,
    TestHostConnectionInfo, HIGHEST_SUPPORTED_VERSION,
};
use crate::discovery::DiscoveryManager;
use crate::execution::ExecutionManager;
use crate::job_queue::JobQueue;
use crate::model::{
    DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestMessageLevel, TestMessagePayload,
    TestRunChangedEventArgs, TestRunCompletePayload, TestRunCriteria,
};
use crate::session::SessionContext;
use crate::{Error, Result};

type Operation = Box<dyn FnOnce() + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a testhost runs requests against.
#[derive(Clone)]
pub struct TestHost {
    pub registry: AdapterRegistry,
    pub session: Arc<SessionContext>,
}

/// Sends handler events back to the orchestrator.
struct WireEvents {
    communication: Arc<CommunicationManager>,
}

impl WireEvents {
    fn send<T: Serialize + ?Sized>(&self, message_type: &str, payload: &T) {
        if let Err(e) = self
            .communication
            .send_message_with_metadata(message_type, payload, &MessageMetadata::default())
        {
            tracing::error!("Failed to send '{}': {}", message_type, e);
        }
    }

    fn log(&self, level: TestMessageLevel, message: &str) {
        let payload = TestMessagePayload {
            message_level: level,
            message: message.to_string(),
        };
        self.send(message_type::SESSION_MESSAGE, &payload);
    }
}

impl DiscoveryEventsHandler for WireEvents {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        self.send(message_type::TEST_CASES_FOUND, &tests);
    }

    fn handle_discovery_complete(&self, complete: DiscoveryCompletePayload) {
        self.send(message_type::DISCOVERY_COMPLETE, &complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.log(level, message);
    }
}

impl RunEventsHandler for WireEvents {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.send(message_type::TEST_RUN_STATS_CHANGE, &args);
    }

    fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
        self.send(message_type::EXECUTION_COMPLETE, &complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.log(level, message);
    }
}

/// Testhost side of the protocol: connects to the orchestrator and serves
/// its requests until the session ends.
///
/// Discovery and runs execute on a job queue so cancel and abort are read
/// while they are in flight.
pub struct TestRequestHandler {
    communication: Arc<CommunicationManager>,
    role: Mutex<ConnectionRole>,
    operations: Arc<JobQueue<Operation>>,
    current_run: Mutex<Option<Arc<ExecutionManager>>>,
    shutdown: CancellationToken,
}

impl TestRequestHandler {
    pub fn new(connection_info: &TestHostConnectionInfo) -> Result<Self> {
        let operations = JobQueue::new(
            Box::new(|operation: Operation| operation()),
            "TestHostOperationQueue",
            usize::MAX,
            usize::MAX,
            false,
            Arc::new(|e: String| tracing::error!("Testhost operation failed: {}", e)),
        )?;
        Ok(Self {
            communication: Arc::new(CommunicationManager::new(connection_info.transport)),
            role: Mutex::new(connection_info.role),
            operations: Arc::new(operations),
            current_run: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancel to stop `process_requests` from outside, e.g. when the parent
    /// process dies.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn initialize_communication(&self, connection_info: &TestHostConnectionInfo) -> Result<String> {
        *lock(&self.role) = connection_info.role;
        match connection_info.role {
            ConnectionRole::Client => {
                self.communication.setup_client_async(&connection_info.endpoint).await?;
                Ok(connection_info.endpoint.clone())
            }
            ConnectionRole::Host => self.communication.host_server(&connection_info.endpoint).await,
        }
    }

    pub async fn wait_for_request_sender_connection(&self, timeout: Duration) -> bool {
        let role = *lock(&self.role);
        match role {
            ConnectionRole::Client => self.communication.wait_for_server_connection(timeout).await,
            ConnectionRole::Host => self.communication.wait_for_client_connection(timeout).await,
        }
    }

    pub fn protocol_version(&self) -> i32 {
        self.communication.default_version()
    }

    /// Serve requests until the orchestrator ends the session, the
    /// connection drops or the shutdown token fires. A run still in flight
    /// is aborted; queued operations finish before this returns.
    pub async fn process_requests(&self, host: TestHost) -> Result<()> {
        let outcome = self.dispatch_loop(&host).await;

        let run = lock(&self.current_run).take();
        if let Some(run) = run {
            if !run.is_finished() {
                tracing::warn!("Aborting the test run still in progress");
                run.abort();
            }
        }

        let operations = Arc::clone(&self.operations);
        let drained = tokio::task::spawn_blocking(move || operations.flush().and_then(|_| operations.dispose()))
            .await
            .map_err(|e| Error::Protocol(format!("Operation queue join failed: {}", e)))?;
        if let Err(e) = drained {
            tracing::warn!("Operation queue shutdown: {}", e);
        }

        self.communication.stop_client();
        self.communication.stop_server();
        outcome
    }

    async fn dispatch_loop(&self, host: &TestHost) -> Result<()> {
        loop {
            let message = match self.communication.receive_message_async(&self.shutdown).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::warn!("Orchestrator closed the connection");
                    return Ok(());
                }
                Err(Error::Cancelled(_)) => {
                    tracing::info!("Testhost shutting down");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            tracing::debug!("Received '{}'", message.message_type);

            if message.is(message_type::SESSION_END) {
                tracing::info!("Session end requested");
                self.communication.mark_completing();
                return Ok(());
            }
            if let Err(e) = self.on_message(&message, host) {
                tracing::error!("Failed to handle '{}': {}", message.message_type, e);
                self.wire_events().log(TestMessageLevel::Error, &e.to_string());
            }
        }
    }

    fn on_message(&self, message: &Message, host: &TestHost) -> Result<()> {
        match message.message_type.as_str() {
            message_type::VERSION_CHECK => {
                let offered: i32 = self.communication.deserialize_payload(message)?;
                let negotiated = offered.clamp(0, HIGHEST_SUPPORTED_VERSION);
                tracing::info!("Orchestrator offered version {}, using {}", offered, negotiated);
                self.communication.send_message_with_metadata(
                    message_type::VERSION_CHECK,
                    &negotiated,
                    &MessageMetadata::with_version(0),
                )?;
                self.communication.set_default_version(negotiated);
                Ok(())
            }
            message_type::DISCOVERY_INITIALIZE | message_type::EXECUTION_INITIALIZE => {
                let paths: Vec<String> = self.communication.deserialize_payload(message)?;
                tracing::debug!("{} with {} extension path(s)", message.message_type, paths.len());
                Ok(())
            }
            message_type::START_DISCOVERY => {
                let criteria: DiscoveryCriteria = self.communication.deserialize_payload(message)?;
                let manager = DiscoveryManager::new(host.registry.clone(), host.session.clone());
                let events: Arc<dyn DiscoveryEventsHandler> = Arc::new(self.wire_events());
                self.operations
                    .queue_job(Box::new(move || manager.discover(&criteria, events)), 0)
            }
            message_type::START_TEST_EXECUTION_WITH_SOURCES | message_type::START_TEST_EXECUTION_WITH_TESTS => {
                let criteria: TestRunCriteria = self.communication.deserialize_payload(message)?;
                let manager = Arc::new(ExecutionManager::new(host.registry.clone(), host.session.clone()));
                *lock(&self.current_run) = Some(Arc::clone(&manager));
                let events: Arc<dyn RunEventsHandler> = Arc::new(self.wire_events());
                self.operations
                    .queue_job(Box::new(move || manager.run_tests(&criteria, events)), 0)
            }
            message_type::CANCEL_TEST_RUN => {
                match lock(&self.current_run).as_ref() {
                    Some(run) => run.cancel(),
                    None => tracing::debug!("Cancel received with no run in progress"),
                }
                Ok(())
            }
            message_type::ABORT_TEST_RUN => {
                match lock(&self.current_run).as_ref() {
                    Some(run) => run.abort(),
                    None => tracing::debug!("Abort received with no run in progress"),
                }
                Ok(())
            }
            other => {
                tracing::warn!("Ignoring unknown message '{}'", other);
                Ok(())
            }
        }
    }

    fn wire_events(&self) -> WireEvents {
        WireEvents {
            communication: Arc::clone(&self.communication),
        }
    }
}

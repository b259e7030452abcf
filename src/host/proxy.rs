use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::data_collection::ProxyDataCollectionManager;
use super::launcher::TestHostLauncher;
use crate::communication::{ConnectionRole, TestHostConnectionInfo};
use crate::model::{
    DiscoveryCompletePayload, DiscoveryCriteria, TestMessageLevel, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCompletePayload, TestRunCriteria,
};
use crate::protocol::{DiscoveryEventsHandler, RunEventsHandler, RunLogger, TestRequestSender};
use crate::session::{metric_names, SessionContext};
use crate::{Error, Result};

/// How long a testhost gets to exit on its own after session end.
const EXIT_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct HostProcess {
    process_id: Option<u32>,
    exited: tokio::task::JoinHandle<()>,
}

/// Owns one testhost: launches it, connects and negotiates the protocol,
/// and tears it down.
pub struct ProxyOperationManager {
    sender: Arc<TestRequestSender>,
    launcher: Arc<dyn TestHostLauncher>,
    session: Arc<SessionContext>,
    cancel: CancellationToken,
    kill: CancellationToken,
    host: tokio::sync::Mutex<Option<HostProcess>>,
    process_id: Mutex<Option<u32>>,
    environment: Mutex<BTreeMap<String, String>>,
}

impl ProxyOperationManager {
    pub fn new(session: Arc<SessionContext>, launcher: Arc<dyn TestHostLauncher>) -> Self {
        let transport = session.settings.transport;
        let connection_info = TestHostConnectionInfo {
            endpoint: transport.default_endpoint(),
            role: ConnectionRole::Host,
            transport,
        };
        let timeout = Duration::from_millis(session.settings.connection_timeout_ms);
        Self {
            sender: Arc::new(TestRequestSender::new(connection_info, timeout)),
            launcher,
            session,
            cancel: CancellationToken::new(),
            kill: CancellationToken::new(),
            host: tokio::sync::Mutex::new(None),
            process_id: Mutex::new(None),
            environment: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn sender(&self) -> &TestRequestSender {
        &self.sender
    }

    pub fn test_host_process_id(&self) -> Option<u32> {
        *lock(&self.process_id)
    }

    /// Extra environment for the testhost; applies to the next launch.
    pub fn set_environment_variables(&self, environment: BTreeMap<String, String>) {
        *lock(&self.environment) = environment;
    }

    /// Launch the testhost and wait until it is connected and has agreed
    /// on a protocol version. Does nothing if already set up.
    pub async fn setup_channel(&self) -> Result<()> {
        let mut host = self.host.lock().await;
        if host.is_some() {
            return Ok(());
        }

        let bound = self.sender.initialize_communication().await?;
        let child_info = TestHostConnectionInfo {
            endpoint: bound,
            role: ConnectionRole::Client,
            transport: self.session.settings.transport,
        };
        let environment = lock(&self.environment).clone();
        let child = self.launcher.launch(&child_info, &environment)?;
        let process_id = child.id();
        *lock(&self.process_id) = process_id;
        *host = Some(HostProcess {
            process_id,
            exited: monitor(child, self.sender.clone(), self.kill.clone()),
        });

        let started = Instant::now();
        let timeout = Duration::from_millis(self.session.settings.connection_timeout_ms);
        if !self.sender.wait_for_request_handler_connection(timeout, &self.cancel).await {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled("Testhost setup cancelled.".to_string()));
            }
            if self.sender.has_client_exited() {
                return Err(Error::TestHostExited(self.sender.client_exit_error().unwrap_or_default()));
            }
            return Err(Error::ConnectionTimeout(self.session.settings.connection_timeout_ms));
        }
        self.session
            .metrics
            .add(metric_names::CONNECTION_TIME, started.elapsed().as_secs_f64());

        self.sender.check_version_with_test_host().await?;
        Ok(())
    }

    /// Stop waiting for the testhost to connect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// End the session, give the testhost a moment to exit, then kill it.
    pub async fn close(&self) {
        self.sender.end_session();
        if let Some(host) = self.host.lock().await.take() {
            let mut exited = host.exited;
            if tokio::time::timeout(EXIT_GRACE, &mut exited).await.is_err() {
                tracing::info!("Testhost {:?} still running, killing it", host.process_id);
                self.kill.cancel();
                let _ = exited.await;
            }
        }
        self.sender.close();
    }
}

/// Wait for the child to exit (or kill it), then report its stderr to the
/// sender.
fn monitor(mut child: Child, sender: Arc<TestRequestSender>, kill: CancellationToken) -> tokio::task::JoinHandle<()> {
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_string(&mut text).await {
                tracing::debug!("Reading testhost stderr failed: {}", e);
            }
        }
        text
    });

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill testhost: {}", e);
                }
                child.wait().await
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        match status {
            Ok(status) if status.success() => tracing::info!("Testhost exited"),
            Ok(status) => tracing::warn!("Testhost exited with {}", status),
            Err(e) => tracing::error!("Waiting for testhost failed: {}", e),
        }
        sender.on_client_process_exit(&stderr);
    })
}

/// Discovery through a testhost process.
pub struct ProxyDiscoveryManager {
    operation: ProxyOperationManager,
}

impl ProxyDiscoveryManager {
    pub fn new(operation: ProxyOperationManager) -> Self {
        Self { operation }
    }

    pub async fn discover(&self, criteria: &DiscoveryCriteria, handler: &dyn DiscoveryEventsHandler) {
        let ready = match self.operation.setup_channel().await {
            Ok(()) => self.operation.sender().initialize_discovery(&[]),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            let message = format!("Failed to start testhost for discovery: {}", e);
            tracing::error!("{}", message);
            handler.handle_log_message(TestMessageLevel::Error, &message);
            handler.handle_discovery_complete(DiscoveryCompletePayload::aborted());
            return;
        }
        self.operation.sender().discover_tests(criteria, handler).await;
    }

    pub fn abort(&self) {
        self.operation.cancel();
    }

    pub async fn close(&self) {
        self.operation.close().await;
    }
}

/// Holds the completion back so data collection can finish before the
/// caller sees it.
struct HeldCompletion<'a> {
    inner: &'a dyn RunEventsHandler,
    complete: Mutex<Option<TestRunCompletePayload>>,
}

impl RunEventsHandler for HeldCompletion<'_> {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.inner.handle_test_run_stats_change(args);
    }

    fn handle_test_run_complete(&self, complete: TestRunCompletePayload) {
        *lock(&self.complete) = Some(complete);
    }

    fn handle_log_message(&self, level: TestMessageLevel, message: &str) {
        self.inner.handle_log_message(level, message);
    }

    fn handle_raw_message(&self, raw: &str) {
        self.inner.handle_raw_message(raw);
    }
}

/// Test runs through a testhost process, optionally with a datacollector
/// alongside.
pub struct ProxyExecutionManager {
    operation: ProxyOperationManager,
    data_collection: Option<ProxyDataCollectionManager>,
}

impl ProxyExecutionManager {
    pub fn new(operation: ProxyOperationManager) -> Self {
        Self {
            operation,
            data_collection: None,
        }
    }

    pub fn with_data_collection(mut self, data_collection: ProxyDataCollectionManager) -> Self {
        self.data_collection = Some(data_collection);
        self
    }

    /// If the datacollector cannot be started the run goes ahead without it.
    pub async fn start_test_run(&self, criteria: &TestRunCriteria, handler: &dyn RunEventsHandler) {
        let logger = RunLogger(handler);
        let collecting = match &self.data_collection {
            Some(data_collection) => match self.start_data_collection(data_collection, criteria, &logger).await {
                Ok(()) => Some(data_collection),
                Err(e) => {
                    let message = format!("Data collection disabled: {}", e);
                    tracing::warn!("{}", message);
                    handler.handle_log_message(TestMessageLevel::Warning, &message);
                    None
                }
            },
            None => None,
        };

        let held = HeldCompletion {
            inner: handler,
            complete: Mutex::new(None),
        };
        self.run_on_test_host(criteria, &held, collecting).await;
        let mut complete = lock(&held.complete).take().unwrap_or_else(|| TestRunCompletePayload {
            test_run_complete_args: TestRunCompleteEventArgs::aborted(None),
            ..Default::default()
        });

        if let Some(data_collection) = collecting {
            let is_canceled = complete.test_run_complete_args.is_canceled;
            match data_collection.after_test_run_end(is_canceled, &logger).await {
                Ok(result) => complete.run_attachments.extend(result.attachment_sets),
                Err(e) => {
                    let message = format!("Data collection did not finish: {}", e);
                    tracing::warn!("{}", message);
                    handler.handle_log_message(TestMessageLevel::Warning, &message);
                }
            }
        }
        handler.handle_test_run_complete(complete);
    }

    async fn start_data_collection(
        &self,
        data_collection: &ProxyDataCollectionManager,
        criteria: &TestRunCriteria,
        logger: &RunLogger<'_>,
    ) -> Result<()> {
        data_collection.initialize().await?;
        let environment = data_collection
            .before_test_run_start(&run_sources(criteria), logger)
            .await?;
        tracing::debug!("Testhost environment from datacollector: {:?}", environment);
        self.operation.set_environment_variables(environment);
        Ok(())
    }

    async fn run_on_test_host(
        &self,
        criteria: &TestRunCriteria,
        handler: &dyn RunEventsHandler,
        collecting: Option<&ProxyDataCollectionManager>,
    ) {
        let ready = match self.operation.setup_channel().await {
            Ok(()) => self.operation.sender().initialize_execution(&[]),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            let message = format!("Failed to start testhost for test run: {}", e);
            tracing::error!("{}", message);
            handler.handle_log_message(TestMessageLevel::Error, &message);
            handler.handle_test_run_complete(TestRunCompletePayload {
                test_run_complete_args: TestRunCompleteEventArgs::aborted(Some(message)),
                ..Default::default()
            });
            return;
        }
        if let (Some(data_collection), Some(process_id)) = (collecting, self.test_host_process_id()) {
            data_collection.test_host_launched(process_id);
        }
        self.operation.sender().start_test_run(criteria, handler).await;
    }

    pub fn cancel(&self) {
        self.operation.cancel();
        if let Err(e) = self.operation.sender().send_test_run_cancel() {
            tracing::debug!("Cancel not sent: {}", e);
        }
    }

    pub fn abort(&self) {
        self.operation.cancel();
        if let Err(e) = self.operation.sender().send_test_run_abort() {
            tracing::debug!("Abort not sent: {}", e);
        }
    }

    pub fn test_host_process_id(&self) -> Option<u32> {
        self.operation.test_host_process_id()
    }

    pub async fn close(&self) {
        self.operation.close().await;
        if let Some(data_collection) = &self.data_collection {
            data_collection.close().await;
        }
    }
}

/// Sources a run touches, in first-seen order.
fn run_sources(criteria: &TestRunCriteria) -> Vec<String> {
    let mut sources = criteria.sources.clone().unwrap_or_default();
    for test in criteria.tests.iter().flatten() {
        if !sources.contains(&test.source) {
            sources.push(test.source.clone());
        }
    }
    sources
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;

use super::launcher::DataCollectorLauncher;
use crate::adapter::MessageLogger;
use crate::model::{AfterTestRunEndResult, BeforeTestRunStartPayload};
use crate::protocol::DataCollectionRequestSender;
use crate::session::SessionContext;
use crate::{Error, Result};

/// How long a datacollector gets to exit after its last reply.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Orchestrator side of one datacollector process: launches it and relays
/// the run hooks.
pub struct ProxyDataCollectionManager {
    sender: DataCollectionRequestSender,
    launcher: Arc<dyn DataCollectorLauncher>,
    session: Arc<SessionContext>,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl ProxyDataCollectionManager {
    pub fn new(session: Arc<SessionContext>, launcher: Arc<dyn DataCollectorLauncher>) -> Self {
        Self {
            sender: DataCollectionRequestSender::new(session.settings.transport),
            launcher,
            session,
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch the datacollector and wait for it to connect.
    pub async fn initialize(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }
        let endpoint = self.sender.initialize_communication().await?;
        *process = Some(self.launcher.launch(&endpoint, self.session.settings.transport)?);

        let timeout_ms = self.session.settings.connection_timeout_ms;
        if !self
            .sender
            .wait_for_request_handler_connection(Duration::from_millis(timeout_ms))
            .await
        {
            return Err(Error::ConnectionTimeout(timeout_ms));
        }
        tracing::info!("Datacollector connected on {}", endpoint);
        Ok(())
    }

    /// Environment the testhost must be launched with.
    pub async fn before_test_run_start(
        &self,
        sources: &[String],
        logger: &dyn MessageLogger,
    ) -> Result<BTreeMap<String, String>> {
        let payload = BeforeTestRunStartPayload {
            settings: None,
            sources: sources.to_vec(),
        };
        let result = self
            .sender
            .send_before_test_run_start_and_get_result(&payload, logger)
            .await?;
        Ok(result.environment_variables)
    }

    pub fn test_host_launched(&self, process_id: u32) {
        if let Err(e) = self.sender.send_test_host_launched(process_id) {
            tracing::warn!("Could not tell datacollector about testhost {}: {}", process_id, e);
        }
    }

    /// Collect attachments and metrics; the metrics are also recorded on the
    /// session.
    pub async fn after_test_run_end(&self, is_cancelled: bool, logger: &dyn MessageLogger) -> Result<AfterTestRunEndResult> {
        let result = self
            .sender
            .send_after_test_run_end_and_get_result(is_cancelled, logger)
            .await?;
        for (name, value) in &result.metrics {
            self.session.metrics.add(name, value.clone());
        }
        Ok(result)
    }

    pub async fn close(&self) {
        self.sender.close();
        if let Some(mut child) = self.process.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("Datacollector exited with {}", status),
                Ok(Err(e)) => tracing::warn!("Waiting for datacollector failed: {}", e),
                Err(_) => {
                    tracing::info!("Datacollector still running, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill datacollector: {}", e);
                    }
                }
            }
        }
    }
}

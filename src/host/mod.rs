//! Testhost and datacollector processes, and the orchestrator-side proxies
//! that launch and drive them.

mod data_collection;
mod launcher;
mod proxy;

pub use data_collection::ProxyDataCollectionManager;
pub use launcher::{
    is_process_alive, watch_parent_process, DataCollectorLauncher, ProcessDataCollectorLauncher,
    ProcessTestHostLauncher, TestHostLauncher,
};
pub use proxy::{ProxyDiscoveryManager, ProxyExecutionManager, ProxyOperationManager};

use std::time::Duration;

use crate::adapter::AdapterRegistry;
use crate::communication::{TestHostConnectionInfo, TransportKind};
use crate::config::HostSettings;
use crate::protocol::{DataCollectionRequestHandler, TestHost, TestRequestHandler, TimingCollector};
use crate::session::SessionContext;
use crate::{Error, Result};

/// Testhost process entry: connect to the orchestrator and serve its
/// requests with the built-in adapters until the session ends or the
/// parent process exits.
pub async fn run_test_host(
    connection_info: TestHostConnectionInfo,
    parent_process_id: Option<u32>,
    settings: HostSettings,
) -> Result<()> {
    let handler = TestRequestHandler::new(&connection_info)?;
    let watcher = parent_process_id.map(|pid| watch_parent_process(pid, handler.shutdown_token()));

    handler.initialize_communication(&connection_info).await?;
    if !handler
        .wait_for_request_sender_connection(Duration::from_millis(settings.connection_timeout_ms))
        .await
    {
        return Err(Error::ConnectionTimeout(settings.connection_timeout_ms));
    }
    tracing::info!("Testhost connected to {}", connection_info.endpoint);

    let host = TestHost {
        registry: AdapterRegistry::builtin(),
        session: SessionContext::new(settings),
    };
    let result = handler.process_requests(host).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    result
}

/// Datacollector process entry, serving the built-in timing collector.
pub async fn run_data_collector(endpoint: &str, transport: TransportKind, settings: &HostSettings) -> Result<()> {
    let handler = DataCollectionRequestHandler::new(transport);
    handler.initialize_communication(endpoint).await?;
    if !handler
        .wait_for_request_sender_connection(Duration::from_millis(settings.connection_timeout_ms))
        .await
    {
        return Err(Error::ConnectionTimeout(settings.connection_timeout_ms));
    }
    handler.process_requests(&TimingCollector::new()).await
}

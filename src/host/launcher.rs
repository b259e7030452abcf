use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::communication::{TestHostConnectionInfo, TransportKind};
use crate::{Error, Result};

const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Starts a testhost process that connects back to `connection_info`.
pub trait TestHostLauncher: Send + Sync {
    /// `environment` is added to the child's inherited environment. The
    /// child must have stderr piped so its exit can be explained.
    fn launch(
        &self,
        connection_info: &TestHostConnectionInfo,
        environment: &BTreeMap<String, String>,
    ) -> Result<Child>;
}

/// Starts a datacollector process that connects to `endpoint`.
pub trait DataCollectorLauncher: Send + Sync {
    fn launch(&self, endpoint: &str, transport: TransportKind) -> Result<Child>;
}

fn own_executable() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| Error::TestHostLaunchFailed(format!("Cannot locate own executable: {}", e)))
}

/// Launches this executable's `testhost` subcommand.
pub struct ProcessTestHostLauncher {
    program: PathBuf,
}

impl ProcessTestHostLauncher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            program: own_executable()?,
        })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Arguments passed to the testhost.
    pub fn arguments(connection_info: &TestHostConnectionInfo) -> Vec<String> {
        vec![
            "testhost".to_string(),
            "--endpoint".to_string(),
            connection_info.endpoint.clone(),
            "--transport".to_string(),
            connection_info.transport.to_string(),
            "--parent-process-id".to_string(),
            std::process::id().to_string(),
        ]
    }
}

impl TestHostLauncher for ProcessTestHostLauncher {
    fn launch(
        &self,
        connection_info: &TestHostConnectionInfo,
        environment: &BTreeMap<String, String>,
    ) -> Result<Child> {
        let child = Command::new(&self.program)
            .args(Self::arguments(connection_info))
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TestHostLaunchFailed(format!("{}: {}", self.program.display(), e)))?;
        tracing::info!(
            "Launched testhost {} (pid {:?})",
            self.program.display(),
            child.id()
        );
        Ok(child)
    }
}

/// Launches this executable's `datacollector` subcommand.
pub struct ProcessDataCollectorLauncher {
    program: PathBuf,
}

impl ProcessDataCollectorLauncher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            program: own_executable()?,
        })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn arguments(endpoint: &str, transport: TransportKind) -> Vec<String> {
        vec![
            "datacollector".to_string(),
            "--endpoint".to_string(),
            endpoint.to_string(),
            "--transport".to_string(),
            transport.to_string(),
        ]
    }
}

impl DataCollectorLauncher for ProcessDataCollectorLauncher {
    fn launch(&self, endpoint: &str, transport: TransportKind) -> Result<Child> {
        let child = Command::new(&self.program)
            .args(Self::arguments(endpoint, transport))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TestHostLaunchFailed(format!("datacollector {}: {}", self.program.display(), e)))?;
        tracing::info!("Launched datacollector (pid {:?})", child.id());
        Ok(child)
    }
}

/// Whether `pid` exists, even if we lack permission to signal it.
pub fn is_process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    matches!(err.raw_os_error(), Some(libc::EPERM))
}

/// Cancel `shutdown` once `parent_pid` has exited.
pub fn watch_parent_process(parent_pid: u32, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(PARENT_POLL_INTERVAL) => {
                    if !is_process_alive(parent_pid) {
                        tracing::warn!("Parent process {} exited, shutting down testhost", parent_pid);
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    })
}

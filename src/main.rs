use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use vstest::adapter::libtest;
use vstest::communication::{ConnectionRole, TestHostConnectionInfo, TransportKind};
use vstest::config::{self, HostSettings};
use vstest::host::{
    run_data_collector, run_test_host, ProcessDataCollectorLauncher, ProcessTestHostLauncher,
    ProxyDataCollectionManager, ProxyDiscoveryManager, ProxyExecutionManager, ProxyOperationManager,
};
use vstest::logger::{ConsoleLogger, LoggerEvents, LoggerEventsHandler};
use vstest::model::{DiscoveryCriteria, TestCase, TestOutcome, TestRunCriteria};
use vstest::session::SessionContext;
use vstest::Result;

#[derive(Parser)]
#[command(name = "vstest", version, about = "Discover and run tests through an isolated testhost")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tests in one or more test binaries
    Discover(SourceArgs),
    /// Run the tests in one or more test binaries
    Run {
        #[command(flatten)]
        sources: SourceArgs,
        /// Only run these fully qualified test names
        #[arg(long, value_delimiter = ',')]
        tests: Vec<String>,
        /// Attach the timing datacollector to the run
        #[arg(long)]
        collect: bool,
    },
    /// Serve an orchestrator's requests; launched by discover and run
    Testhost {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Exit once this process is gone
        #[arg(long)]
        parent_process_id: Option<u32>,
    },
    /// Serve data collection hooks; launched by run --collect
    Datacollector {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Test binaries
    #[arg(required = true)]
    sources: Vec<String>,
    /// Also print passed and skipped tests
    #[arg(long)]
    verbose: bool,
}

impl SourceArgs {
    fn resolved(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| {
                std::fs::canonicalize(s)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| s.clone())
            })
            .collect()
    }
}

#[derive(Args)]
struct ConnectionArgs {
    /// Address to connect to
    #[arg(long)]
    endpoint: String,
    /// tcp or unix; defaults to the configured transport
    #[arg(long)]
    transport: Option<TransportKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let succeeded = match Cli::parse().command {
        Command::Discover(sources) => discover(sources).await?,
        Command::Run {
            sources,
            tests,
            collect,
        } => run(sources, tests, collect).await?,
        Command::Testhost {
            connection,
            parent_process_id,
        } => {
            testhost(connection, parent_process_id).await?;
            true
        }
        Command::Datacollector { connection } => {
            let settings = config::resolve(None);
            let transport = connection.transport.unwrap_or(settings.transport);
            run_data_collector(&connection.endpoint, transport, &settings).await?;
            true
        }
    };
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Logger events with the console logger attached.
fn console_events(settings: &HostSettings, verbose: bool) -> Result<(Arc<LoggerEvents>, vstest::logger::Subscription)> {
    let events = Arc::new(LoggerEvents::new(settings)?);
    let subscription = events.subscribe(Arc::new(ConsoleLogger::stdout(verbose)));
    events.enable_events();
    Ok((events, subscription))
}

fn proxy_operation(session: &Arc<SessionContext>) -> Result<ProxyOperationManager> {
    Ok(ProxyOperationManager::new(
        Arc::clone(session),
        Arc::new(ProcessTestHostLauncher::new()?),
    ))
}

async fn discover(args: SourceArgs) -> Result<bool> {
    let settings = config::resolve(std::env::current_dir().ok().as_deref());
    let (events, _console) = console_events(&settings, args.verbose)?;
    let handler = LoggerEventsHandler::new(events);

    let mut criteria = DiscoveryCriteria::new(args.resolved());
    criteria.frequency_of_discovered_test_events = settings.discovery_cache_size;
    criteria.discovered_test_event_timeout_ms = settings.discovery_cache_timeout_ms;

    let session = SessionContext::new(settings);
    let proxy = ProxyDiscoveryManager::new(proxy_operation(&session)?);
    proxy.discover(&criteria, &handler).await;
    proxy.close().await;

    Ok(handler.discovery_outcome().is_some_and(|c| !c.is_aborted))
}

async fn run(args: SourceArgs, names: Vec<String>, collect: bool) -> Result<bool> {
    let settings = config::resolve(std::env::current_dir().ok().as_deref());
    let (events, _console) = console_events(&settings, args.verbose)?;
    let handler = LoggerEventsHandler::new(events);

    let sources = args.resolved();
    let names: Vec<&str> = names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()).collect();
    let mut criteria = if names.is_empty() {
        TestRunCriteria::with_sources(sources)
    } else {
        let tests = sources
            .iter()
            .flat_map(|source| {
                names
                    .iter()
                    .map(move |name| TestCase::new(name, libtest::EXECUTOR_URI, source))
            })
            .collect();
        TestRunCriteria::with_tests(tests)
    };
    criteria.frequency_of_run_stats_change_event = settings.run_cache_size;
    criteria.run_stats_change_event_timeout_ms = settings.run_cache_timeout_ms;

    let session = SessionContext::new(settings);
    let mut proxy = ProxyExecutionManager::new(proxy_operation(&session)?);
    if collect {
        proxy = proxy.with_data_collection(ProxyDataCollectionManager::new(
            Arc::clone(&session),
            Arc::new(ProcessDataCollectorLauncher::new()?),
        ));
    }
    let proxy = Arc::new(proxy);
    let interrupt = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling test run");
                proxy.cancel();
            }
        })
    };
    proxy.start_test_run(&criteria, &handler).await;
    interrupt.abort();
    proxy.close().await;

    Ok(handler.run_outcome().is_some_and(|c| {
        let failed = c
            .test_run_statistics
            .as_ref()
            .map(|s| s.count(TestOutcome::Failed))
            .unwrap_or(0);
        !c.is_aborted && !c.is_canceled && failed == 0
    }))
}

async fn testhost(connection: ConnectionArgs, parent_process_id: Option<u32>) -> Result<()> {
    let settings = config::resolve(None);
    let connection_info = TestHostConnectionInfo {
        role: ConnectionRole::Client,
        transport: connection.transport.unwrap_or(settings.transport),
        endpoint: connection.endpoint,
    };
    run_test_host(connection_info, parent_process_id, settings).await
}

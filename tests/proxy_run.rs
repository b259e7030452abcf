mod common;

use std::sync::Arc;
use std::time::Duration;

use vstest::config::HostSettings;
use vstest::host::{
    ProcessDataCollectorLauncher, ProcessTestHostLauncher, ProxyDataCollectionManager,
    ProxyExecutionManager, ProxyOperationManager,
};
use vstest::model::{TestMessageLevel, TestOutcome, TestRunCriteria};
use vstest::protocol::{RUN_DURATION_METRIC, TEST_HOST_PROCESS_METRIC};
use vstest::session::SessionContext;

use common::{compile_test_binary, RunRecorder, COLLECTOR_AWARE_SUITE};

const PROGRAM: &str = env!("CARGO_BIN_EXE_vstest");
const WAIT: Duration = Duration::from_secs(60);

fn execution_proxy(session: &Arc<SessionContext>, collector_program: &str) -> ProxyExecutionManager {
    let operation = ProxyOperationManager::new(
        Arc::clone(session),
        Arc::new(ProcessTestHostLauncher::with_program(PROGRAM)),
    );
    ProxyExecutionManager::new(operation).with_data_collection(ProxyDataCollectionManager::new(
        Arc::clone(session),
        Arc::new(ProcessDataCollectorLauncher::with_program(collector_program)),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_collector_environment_reaches_tests() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), COLLECTOR_AWARE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    let session = SessionContext::new(HostSettings::default());
    let proxy = execution_proxy(&session, PROGRAM);

    let recorder = RunRecorder::default();
    let criteria = TestRunCriteria::with_sources(vec![suite.to_string_lossy().into_owned()]);
    tokio::time::timeout(WAIT, proxy.start_test_run(&criteria, &recorder))
        .await
        .unwrap();
    proxy.close().await;

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    let args = complete.test_run_complete_args;
    assert!(!args.is_aborted && !args.is_canceled);
    let stats = args.test_run_statistics.unwrap();
    assert_eq!(stats.count(TestOutcome::Passed), 1);
    assert_eq!(stats.count(TestOutcome::Failed), 0);

    assert!(session.metrics.get(RUN_DURATION_METRIC).is_some());
    let pid = proxy.test_host_process_id().unwrap();
    assert_eq!(session.metrics.get(TEST_HOST_PROCESS_METRIC), Some(serde_json::Value::from(pid)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_continues_when_collector_cannot_start() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), COLLECTOR_AWARE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    let session = SessionContext::new(HostSettings::default());
    let proxy = execution_proxy(&session, "/nonexistent/vstest-datacollector");

    let recorder = RunRecorder::default();
    let criteria = TestRunCriteria::with_sources(vec![suite.to_string_lossy().into_owned()]);
    tokio::time::timeout(WAIT, proxy.start_test_run(&criteria, &recorder))
        .await
        .unwrap();
    proxy.close().await;

    let messages = recorder.messages.lock().unwrap();
    assert!(messages
        .iter()
        .any(|(level, m)| *level == TestMessageLevel::Warning && m.starts_with("Data collection disabled")));

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    let args = complete.test_run_complete_args;
    assert!(!args.is_aborted);
    assert_eq!(args.test_run_statistics.unwrap().count(TestOutcome::Failed), 1);
    assert!(session.metrics.get(RUN_DURATION_METRIC).is_none());
}

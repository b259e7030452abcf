mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vstest::communication::{
    ConnectionRole, TestHostConnectionInfo, TransportKind, HIGHEST_SUPPORTED_VERSION,
};
use vstest::config::HostSettings;
use vstest::model::{DiscoveryCriteria, TestCase, TestMessageLevel, TestOutcome, TestRunCriteria};
use vstest::protocol::{TestHost, TestRequestHandler, TestRequestSender};
use vstest::session::SessionContext;

use common::{fake_registry, DiscoveryRecorder, RunRecorder, FAKE_URI};

const WAIT: Duration = Duration::from_secs(10);

/// An orchestrator-side sender connected to an in-process testhost serving
/// the fake adapter, plus the testhost's shutdown token.
async fn connect(
    transport: TransportKind,
    tests: Vec<&'static str>,
) -> (
    Arc<TestRequestSender>,
    tokio::task::JoinHandle<vstest::Result<()>>,
    CancellationToken,
) {
    let sender = Arc::new(TestRequestSender::new(
        TestHostConnectionInfo {
            endpoint: transport.default_endpoint(),
            role: ConnectionRole::Host,
            transport,
        },
        WAIT,
    ));
    let endpoint = sender.initialize_communication().await.unwrap();

    let client_info = TestHostConnectionInfo {
        endpoint,
        role: ConnectionRole::Client,
        transport,
    };
    let handler = Arc::new(TestRequestHandler::new(&client_info).unwrap());
    handler.initialize_communication(&client_info).await.unwrap();
    let shutdown = handler.shutdown_token();
    let host = TestHost {
        registry: fake_registry(tests),
        session: SessionContext::new(HostSettings::default()),
    };
    let serve = tokio::spawn(async move {
        assert!(handler.wait_for_request_sender_connection(WAIT).await);
        handler.process_requests(host).await
    });

    assert!(
        sender
            .wait_for_request_handler_connection(WAIT, &CancellationToken::new())
            .await
    );
    (sender, serve, shutdown)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_version_negotiation_over_tcp() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec![]).await;

    let version = sender.check_version_with_test_host().await.unwrap();
    assert_eq!(version, HIGHEST_SUPPORTED_VERSION);
    assert_eq!(sender.protocol_version(), HIGHEST_SUPPORTED_VERSION);

    sender.end_session();
    serve.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discovery_exchange_over_tcp() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec!["alpha", "beta", "gamma"]).await;
    sender.check_version_with_test_host().await.unwrap();
    sender.initialize_discovery(&[]).unwrap();

    let mut criteria = DiscoveryCriteria::new(vec!["/t/one.fake".to_string(), "/t/two.fake".to_string()]);
    criteria.frequency_of_discovered_test_events = 2;
    criteria.discovered_test_event_timeout_ms = 60_000;
    let recorder = DiscoveryRecorder::default();
    sender.discover_tests(&criteria, &recorder).await;

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    assert!(!complete.is_aborted);
    assert_eq!(complete.total_tests, 6);

    let tests = recorder.tests.lock().unwrap();
    let names: Vec<_> = tests
        .iter()
        .map(|t| format!("{}@{}", t.fully_qualified_name, t.source))
        .collect();
    assert_eq!(
        names,
        vec![
            "alpha@/t/one.fake",
            "beta@/t/one.fake",
            "gamma@/t/one.fake",
            "alpha@/t/two.fake",
            "beta@/t/two.fake",
            "gamma@/t/two.fake",
        ]
    );
    assert!(tests.iter().all(|t| t.executor_uri == FAKE_URI));

    let messages = recorder.messages.lock().unwrap();
    assert!(messages
        .iter()
        .any(|(level, m)| *level == TestMessageLevel::Informational && m == "fake discovery"));

    // Negotiated version is carried on every reply.
    let raw = recorder.raw.lock().unwrap();
    assert!(!raw.is_empty());
    assert!(raw.iter().all(|r| r.contains(&format!("\"Version\":{}", HIGHEST_SUPPORTED_VERSION))));

    sender.end_session();
    serve.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discovery_exchange_over_unix_socket() {
    let (sender, serve, _) = connect(TransportKind::UnixSocket, vec!["only"]).await;
    sender.check_version_with_test_host().await.unwrap();

    let recorder = DiscoveryRecorder::default();
    sender
        .discover_tests(&DiscoveryCriteria::new(vec!["/t/unit.fake".to_string()]), &recorder)
        .await;

    assert_eq!(recorder.complete.lock().unwrap().as_ref().map(|c| c.total_tests), Some(1));

    sender.end_session();
    serve.await.unwrap().unwrap();
    sender.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_exchange_reports_results() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec!["a", "b_fails", "c"]).await;
    sender.check_version_with_test_host().await.unwrap();
    sender.initialize_execution(&[]).unwrap();

    let mut criteria = TestRunCriteria::with_sources(vec!["/t/unit.fake".to_string()]);
    criteria.frequency_of_run_stats_change_event = 2;
    criteria.run_stats_change_event_timeout_ms = 60_000;
    let recorder = RunRecorder::default();
    sender.start_test_run(&criteria, &recorder).await;

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    let args = &complete.test_run_complete_args;
    assert!(!args.is_aborted && !args.is_canceled);
    let stats = args.test_run_statistics.as_ref().unwrap();
    assert_eq!(stats.executed_tests, 3);
    assert_eq!(stats.count(TestOutcome::Failed), 1);
    let last = complete.last_run_tests.as_ref().map(|l| l.new_test_results.len()).unwrap_or(0);
    assert_eq!(recorder.results_seen() + last, 3);
    assert_eq!(complete.executor_uris, vec![FAKE_URI]);

    sender.end_session();
    serve.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_selected_tests() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec![]).await;
    sender.check_version_with_test_host().await.unwrap();

    let tests = vec![TestCase::new("picked", FAKE_URI, "/t/unit.fake")];
    let recorder = RunRecorder::default();
    sender.start_test_run(&TestRunCriteria::with_tests(tests), &recorder).await;

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    let stats = complete.test_run_complete_args.test_run_statistics.unwrap();
    assert_eq!(stats.executed_tests, 1);
    assert_eq!(stats.count(TestOutcome::Passed), 1);

    sender.end_session();
    serve.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_reaches_running_testhost() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec!["first", "second_hangs"]).await;
    sender.check_version_with_test_host().await.unwrap();

    let mut criteria = TestRunCriteria::with_sources(vec!["/t/unit.fake".to_string()]);
    criteria.frequency_of_run_stats_change_event = 1;
    let recorder = RunRecorder::default();

    let canceller = async {
        while recorder.results_seen() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sender.send_test_run_cancel().unwrap();
    };
    tokio::time::timeout(WAIT, async {
        tokio::join!(sender.start_test_run(&criteria, &recorder), canceller);
    })
    .await
    .unwrap();

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    assert!(complete.test_run_complete_args.is_canceled);
    assert_eq!(complete.test_run_complete_args.test_run_statistics.unwrap().executed_tests, 1);

    sender.end_session();
    serve.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_testhost_shutdown_aborts_run_in_progress() {
    let (sender, serve, shutdown) = connect(TransportKind::Tcp, vec!["a", "b_hangs"]).await;
    sender.check_version_with_test_host().await.unwrap();

    let mut criteria = TestRunCriteria::with_sources(vec!["/t/unit.fake".to_string()]);
    criteria.frequency_of_run_stats_change_event = 1;
    let recorder = RunRecorder::default();

    let stopper = async {
        while recorder.results_seen() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
    };
    tokio::time::timeout(WAIT, async {
        tokio::join!(sender.start_test_run(&criteria, &recorder), stopper);
    })
    .await
    .unwrap();

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    assert!(complete.test_run_complete_args.is_aborted);

    tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .expect("testhost should stop once its run is aborted")
        .unwrap()
        .unwrap();
    sender.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_testhost_exit_aborts_discovery() {
    let (sender, serve, _) = connect(TransportKind::Tcp, vec!["a"]).await;
    sender.check_version_with_test_host().await.unwrap();

    sender.on_client_process_exit("segmentation fault\n");
    let recorder = DiscoveryRecorder::default();
    sender
        .discover_tests(&DiscoveryCriteria::new(vec!["/t/unit.fake".to_string()]), &recorder)
        .await;

    let complete = recorder.complete.lock().unwrap().clone().unwrap();
    assert!(complete.is_aborted);
    assert_eq!(complete.total_tests, -1);
    let messages = recorder.messages.lock().unwrap();
    assert!(messages
        .iter()
        .any(|(level, m)| *level == TestMessageLevel::Error && m.contains("segmentation fault")));

    // Session end is skipped after exit; closing the server ends the testhost.
    sender.end_session();
    sender.close();
    let _ = tokio::time::timeout(WAIT, serve).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_wait_times_out_without_testhost() {
    let sender = TestRequestSender::new(
        TestHostConnectionInfo {
            endpoint: "127.0.0.1:0".to_string(),
            role: ConnectionRole::Host,
            transport: TransportKind::Tcp,
        },
        WAIT,
    );
    sender.initialize_communication().await.unwrap();
    assert!(
        !sender
            .wait_for_request_handler_connection(Duration::from_millis(100), &CancellationToken::new())
            .await
    );
    sender.close();
}

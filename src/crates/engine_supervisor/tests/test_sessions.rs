#![cfg(feature = "test-support")]

mod support;

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use engine_supervisor::{
    allocate_loopback_port, CoreService, ExecutionMode, Launcher, RuntimeMode, SessionMode,
    StartRequest, Supervisor, SupervisorError, TestMode, TestRequest, TestTarget,
};
use support::{
    engine_config_with_inbound, engine_config_without_inbound, fake_engine_config, files_in,
    wait_until, HttpResponder,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn direct_socks_target_tunnels_through_running_proxy() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let launcher = Launcher::new(config.clone());
    let (document, port) = engine_config_with_inbound();
    let proxy = launcher
        .spawn(&document, port, "direct-proxy")
        .expect("proxy should start");
    let files_before = files_in(scratch.path()).len();

    let responder = HttpResponder::start();
    let supervisor = Supervisor::new(config);
    let target = TestTarget::from_request(Some(&format!("EXTERNAL_SOCKS:{port}")));
    let ms = supervisor
        .run_url_test(&target, Some(&responder.url("/generate_204")), TIMEOUT)
        .expect("url test should succeed");

    assert!(ms < TIMEOUT.as_millis() as u64);
    assert_eq!(responder.hits(), 1);
    assert_eq!(supervisor.mode(), RuntimeMode::Idle);
    assert_eq!(files_in(scratch.path()).len(), files_before);
    proxy.terminate();
}

#[test]
fn direct_socks_failure_spawns_nothing() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalPreferred);
    let supervisor = Supervisor::new(config);
    let port = allocate_loopback_port().expect("free port");
    let timeout = Duration::from_secs(1);

    let start = Instant::now();
    let err = supervisor
        .run_url_test(
            &TestTarget::DirectSocks(port),
            Some("http://127.0.0.1:9/"),
            timeout,
        )
        .expect_err("nothing listens on the port");
    assert!(start.elapsed() < timeout + Duration::from_secs(1));
    assert!(matches!(err, SupervisorError::ProbeFailure(_)), "{err}");
    assert_eq!(supervisor.mode(), RuntimeMode::Idle);
    assert!(files_in(scratch.path()).is_empty());
}

#[test]
fn ephemeral_runtime_serves_one_test_and_is_torn_down() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalPreferred);
    let supervisor = Supervisor::new(config);
    let responder = HttpResponder::start();

    // No proxy inbound: a test inbound is injected on a fresh port.
    let target = TestTarget::Config(engine_config_without_inbound());
    let session = supervisor
        .open_test_session(&target, TIMEOUT)
        .expect("ephemeral runtime should start");
    assert_eq!(session.mode(), SessionMode::EphemeralExternal);
    let port = session.proxy_port().expect("ephemeral port");
    let config_path = session.config_path().expect("temp config").to_path_buf();
    assert!(config_path.exists());
    assert_eq!(supervisor.mode(), RuntimeMode::Idle);
    assert_eq!(supervisor.current_proxy_port(), None);

    let status = session
        .client()
        .get(responder.url("/generate_204"))
        .send()
        .expect("request through ephemeral runtime")
        .status();
    assert_eq!(status.as_u16(), 204);

    drop(session);
    assert!(!config_path.exists());
    assert!(support::connect_fails_within(port, Duration::from_secs(2)));

    let ms = supervisor
        .run_url_test(&target, Some(&responder.url("/")), TIMEOUT)
        .expect("url test should succeed");
    assert!(ms < TIMEOUT.as_millis() as u64);
    assert!(wait_until(Duration::from_secs(1), || files_in(scratch.path()).is_empty()));
    assert_eq!(supervisor.mode(), RuntimeMode::Idle);
}

#[test]
fn concurrent_ephemeral_sessions_use_distinct_ports() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let supervisor = Supervisor::new(config);
    let target = TestTarget::Config(engine_config_without_inbound());

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let supervisor = supervisor.clone();
            let target = target.clone();
            thread::spawn(move || {
                let session = supervisor
                    .open_test_session(&target, TIMEOUT)
                    .expect("session should open");
                let port = session.proxy_port().expect("port");
                // Hold the session until every thread has one.
                thread::sleep(Duration::from_millis(300));
                port
            })
        })
        .collect();
    let mut ports: Vec<u16> = handles
        .into_iter()
        .map(|handle| handle.join().expect("session thread"))
        .collect();
    ports.sort_unstable();
    ports.dedup();

    assert_eq!(ports.len(), 3);
    assert!(wait_until(Duration::from_secs(2), || files_in(scratch.path()).is_empty()));
}

#[test]
fn active_external_runtime_is_reused_and_left_running() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalPreferred);
    let supervisor = Supervisor::new(config);
    let (document, port) = engine_config_with_inbound();
    supervisor.start(&document).expect("start");
    let responder = HttpResponder::start();

    let session = supervisor
        .open_test_session(&TestTarget::Active, TIMEOUT)
        .expect("reuse session");
    assert_eq!(session.mode(), SessionMode::ReuseActive);
    assert_eq!(session.proxy_port(), Some(port));
    assert!(session.config_path().is_none());
    session.close();

    supervisor
        .run_url_test(&TestTarget::Active, Some(&responder.url("/")), TIMEOUT)
        .expect("url test through active runtime");
    assert_eq!(responder.hits(), 1);
    assert_eq!(supervisor.mode(), RuntimeMode::ExternalActive);
    assert_eq!(files_in(scratch.path()).len(), 1);

    supervisor.stop().unwrap();
}

#[test]
fn ephemeral_config_on_active_port_does_not_measure_the_active_runtime() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let supervisor = Supervisor::new(config);
    let (document, port) = engine_config_with_inbound();
    supervisor.start(&document).expect("start");
    let responder = HttpResponder::start();

    // Same inbound port as the active runtime.
    let err = supervisor
        .run_url_test(&TestTarget::Config(document), Some(&responder.url("/")), TIMEOUT)
        .expect_err("the port belongs to the active runtime");
    assert!(matches!(err, SupervisorError::PortInUse(p) if p == port), "{err}");
    assert_eq!(responder.hits(), 0);
    assert_eq!(supervisor.mode(), RuntimeMode::ExternalActive);
    assert_eq!(supervisor.current_proxy_port(), Some(port));
    assert_eq!(files_in(scratch.path()).len(), 1);

    supervisor.stop().unwrap();
}

#[test]
fn active_target_without_runtime_is_not_running() {
    let (config, _scratch) = fake_engine_config(ExecutionMode::ExternalPreferred);
    let supervisor = Supervisor::new(config);
    let err = supervisor
        .open_test_session(&TestTarget::Active, TIMEOUT)
        .expect_err("idle supervisor");
    assert!(matches!(err, SupervisorError::NotRunning), "{err}");
}

#[test]
fn full_test_reports_throughput() {
    let (config, _scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let supervisor = Supervisor::new(config);
    let responder = HttpResponder::start();
    let target = TestTarget::Config(engine_config_without_inbound());

    let report = supervisor
        .run_full_test(
            &target,
            Some(&responder.url("/")),
            Some(&responder.url("/bytes/262144")),
            TIMEOUT,
        )
        .expect("full test should succeed");
    assert_eq!(report.downloaded_bytes, 262_144);
    assert!(!report.truncated);
    assert!(report.bytes_per_second > 0);
    assert_eq!(responder.hits(), 2);
}

#[test]
fn non_success_status_is_a_probe_failure() {
    let (config, scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let supervisor = Supervisor::new(config);
    let responder = HttpResponder::start();
    let target = TestTarget::Config(engine_config_without_inbound());

    let err = supervisor
        .run_url_test(&target, Some(&responder.url("/status/503")), TIMEOUT)
        .expect_err("503 should fail");
    assert!(matches!(err, SupervisorError::ProbeFailure(_)), "{err}");
    assert!(wait_until(Duration::from_secs(1), || files_in(scratch.path()).is_empty()));
}

#[test]
fn tcp_ping_times_a_plain_connect() {
    let (config, _scratch) = fake_engine_config(ExecutionMode::ExternalPreferred);
    let supervisor = Supervisor::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("addr").to_string();

    let ms = supervisor
        .run_tcp_ping(&address, Duration::from_secs(1))
        .expect("ping should succeed");
    assert!(ms < 1000);

    drop(listener);
    let err = supervisor
        .run_tcp_ping("not an address", Duration::from_secs(1))
        .expect_err("unparseable address");
    assert!(matches!(err, SupervisorError::ProbeFailure(_)), "{err}");
}

#[test]
fn core_service_renders_errors_into_responses() {
    let (config, _scratch) = fake_engine_config(ExecutionMode::ExternalRequired);
    let service = CoreService::new(Supervisor::new(config));
    let responder = HttpResponder::start();

    let missing = service.start(&StartRequest::new(engine_config_without_inbound()));
    assert!(!missing.is_ok());
    assert!(missing.error.contains("inbound"), "{}", missing.error);

    let (document, _) = engine_config_with_inbound();
    assert!(service
        .start(&StartRequest::new(document.clone()).with_stats_outbound("proxy"))
        .is_ok());
    assert!(!service.start(&StartRequest::new(document)).is_ok());

    let response = service.test(
        &TestRequest::new(TestMode::UrlTest)
            .with_url(responder.url("/"))
            .with_timeout(TIMEOUT),
    );
    assert!(response.error.is_empty(), "{}", response.error);
    assert!(response.full.is_none());

    let response = service.test(
        &TestRequest::new(TestMode::FullTest)
            .with_config(engine_config_without_inbound())
            .with_url(responder.url("/"))
            .with_full_test_url(responder.url("/bytes/1024")),
    );
    assert!(response.error.is_empty(), "{}", response.error);
    assert_eq!(response.full.map(|report| report.downloaded_bytes), Some(1024));

    let response = service.test(
        &TestRequest::new(TestMode::TcpPing).with_address("127.0.0.1:1"),
    );
    assert!(!response.error.is_empty());

    assert!(service.stop().is_ok());
    assert!(service.stop().is_ok());
    assert!(service.list_connections().connections.is_empty());
}

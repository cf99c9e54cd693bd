//! Startup and shutdown of the whole daemon against the fake host

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vdesk_core::host::tcp_listening;
use vdesk_core::readiness::wait_until;
use vdesk_core::testing::{free_ports, FakeHost, ScriptedAgentRunner};
use vdesk_daemon::{run_daemon, DaemonConfig, DaemonError};

fn config() -> DaemonConfig {
    let ports = free_ports(6);
    let mut config = DaemonConfig::default();
    config.display.vnc_ports = ports[0..2].to_vec();
    config.display.web_ports = ports[2..4].to_vec();
    config.server.http_addr = "127.0.0.1".to_string();
    config.server.ws_addr = "127.0.0.1".to_string();
    config.server.http_port = ports[4];
    config.server.ws_port = ports[5];
    config.readiness.poll_interval_ms = 10;
    config.readiness.frame_buffer_timeout_secs = 1;
    config.readiness.port_timeout_secs = 2;
    config.readiness.supervisor_interval_secs = 1;
    config
}

#[tokio::test]
async fn test_daemon_serves_until_shutdown() {
    let config = config();
    let http_port = config.server.http_port;
    let ws_port = config.server.ws_port;
    let vnc_port = config.display.vnc_ports[0];

    let host = Arc::new(FakeHost::new());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_daemon(
        config,
        host.clone(),
        Arc::new(ScriptedAgentRunner::new(vec![])),
        shutdown.clone(),
    ));

    let serving = wait_until(Duration::from_millis(20), Duration::from_secs(5), || async move {
        tcp_listening(http_port).await && tcp_listening(ws_port).await
    })
    .await;
    assert!(serving);
    assert!(tcp_listening(vnc_port).await);
    assert_eq!(host.live_count("x11vnc"), 2);

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // Every display process is stopped on the way out
    assert_eq!(host.live_count("x11vnc"), 0);
    assert_eq!(host.live_count("Xvfb"), 0);
    assert!(!tcp_listening(vnc_port).await);
}

#[tokio::test]
async fn test_provisioning_failure_is_fatal() {
    let host = Arc::new(FakeHost::new());
    host.stall_program("Xvfb", "(EE) Cannot establish any listening sockets");

    let result = run_daemon(
        config(),
        host.clone(),
        Arc::new(ScriptedAgentRunner::new(vec![])),
        CancellationToken::new(),
    )
    .await;

    match result {
        Err(DaemonError::Provision(e)) => {
            assert!(e.to_string().contains("Cannot establish any listening sockets"));
        }
        other => panic!("expected a provisioning error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(host.live_count("Xvfb"), 0);
}

#[tokio::test]
async fn test_invalid_config_spawns_nothing() {
    let mut config = config();
    config.display.web_ports.pop();

    let host = Arc::new(FakeHost::new());
    let result = run_daemon(
        config,
        host.clone(),
        Arc::new(ScriptedAgentRunner::new(vec![])),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(DaemonError::ConfigError(_))));
    assert!(host.spawned().is_empty());
}

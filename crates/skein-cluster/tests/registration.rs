//! End-to-end registration tests.
//!
//! Each test starts a register server on an ephemeral port and drives it
//! with real `RegistrationClient`s over TCP.

use std::time::Duration;

use skein_cluster::{
    ClusterError, MembershipView, RegisterHandle, RegisterRequest, RegisterServer,
    RegisterServerConfig, RegistrationClient, RegistrationConfig,
};
use skein_rpc::ClientState;

/// Logs from the server show up with `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server(key: Option<&str>) -> RegisterHandle {
    init_tracing();
    let mut config = RegisterServerConfig::new("127.0.0.1:0");
    config.shared_key = key.map(str::to_string);
    config.sweep_interval = Duration::from_secs(60);
    RegisterServer::start(config).await.unwrap()
}

fn node(server: &RegisterHandle, port: u16, key: Option<&str>) -> RegistrationClient {
    let request = RegisterRequest {
        port: Some(port),
        ..RegisterRequest::default()
    };
    node_with(server, request, key)
}

fn node_with(server: &RegisterHandle, request: RegisterRequest, key: Option<&str>) -> RegistrationClient {
    let mut config = RegistrationConfig::new(server.local_addr().to_string(), request);
    config.shared_key = key.map(str::to_string);
    config.reconnect_delay = Duration::from_millis(100);
    RegistrationClient::start(config)
}

async fn registered(client: &RegistrationClient) -> u32 {
    tokio::time::timeout(Duration::from_secs(5), client.registered())
        .await
        .expect("registration timed out")
        .expect("registration failed")
        .id
}

/// Wait until `view` satisfies `done`.
async fn settle(view: &MembershipView, done: impl Fn(&MembershipView) -> bool) {
    let mut rx = view.subscribe();
    let wait = async {
        while !done(view) {
            if rx.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("membership view never converged");
}

async fn live_count(server: &RegisterHandle, expected: usize) {
    let wait = async {
        while server.registry().live_hosts().unwrap().len() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("registry never reached the expected size");
}

// ── Fan-out ──────────────────────────────────────────────────────

#[tokio::test]
async fn add_and_remove_reach_every_other_node() {
    let server = start_server(None).await;

    let a = node(&server, 7001, None);
    assert_eq!(registered(&a).await, 0);
    let b = node(&server, 7002, None);
    assert_eq!(registered(&b).await, 1);
    settle(a.view(), |v| v.len() == 2).await;

    let c = node(&server, 7003, None);
    assert_eq!(registered(&c).await, 2);
    // C is seeded from reg.ok; A and B learn about it from `add`.
    assert_eq!(c.view().len(), 3);
    settle(a.view(), |v| v.get("default", 2).is_some()).await;
    settle(b.view(), |v| v.get("default", 2).is_some()).await;
    let seen = a.view().get("default", 2).unwrap();
    assert_eq!(seen.port, 7003);
    assert_eq!(seen.ip, "127.0.0.1");

    a.stop().await;
    settle(b.view(), |v| v.get("default", 0).is_none()).await;
    settle(c.view(), |v| v.get("default", 0).is_none()).await;
    assert_eq!(b.view().len(), 2);

    b.stop().await;
    c.stop().await;
    server.shutdown().await;
}

// ── Id policy ────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_live_id_is_rejected() {
    let server = start_server(None).await;

    let first = node_with(
        &server,
        RegisterRequest {
            id: Some(5),
            port: Some(7101),
            ..RegisterRequest::default()
        },
        None,
    );
    assert_eq!(registered(&first).await, 5);

    let second = node_with(
        &server,
        RegisterRequest {
            id: Some(5),
            port: Some(7102),
            ..RegisterRequest::default()
        },
        None,
    );
    let err = tokio::time::timeout(Duration::from_secs(5), second.registered())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        ClusterError::Rejected { code, msg } => {
            assert_eq!(code, 409);
            assert!(msg.contains("already registered"), "{msg}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(second.state(), ClientState::ClosedByServer);
    assert_eq!(server.registry().live_hosts().unwrap().len(), 1);

    first.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn missing_port_is_rejected() {
    let server = start_server(None).await;
    let client = node_with(&server, RegisterRequest::default(), None);
    let err = tokio::time::timeout(Duration::from_secs(5), client.registered())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClusterError::Rejected { code: 409, .. }), "{err:?}");
    server.shutdown().await;
}

#[tokio::test]
async fn restarted_node_gets_its_id_back() {
    let server = start_server(None).await;

    let a = node(&server, 7201, None);
    assert_eq!(registered(&a).await, 0);
    let b = node(&server, 7202, None);
    assert_eq!(registered(&b).await, 1);

    b.stop().await;
    live_count(&server, 1).await;

    // The removed id stays reserved for its address.
    let c = node(&server, 7203, None);
    assert_eq!(registered(&c).await, 2);

    let b_again = node(&server, 7202, None);
    assert_eq!(registered(&b_again).await, 1);

    a.stop().await;
    c.stop().await;
    b_again.stop().await;
    server.shutdown().await;
}

// ── Encryption ───────────────────────────────────────────────────

#[tokio::test]
async fn encrypted_registration_hands_out_a_session_key() {
    let server = start_server(Some("cluster-secret")).await;
    let client = node_with(
        &server,
        RegisterRequest {
            port: Some(7301),
            group: Some("game".into()),
            encrypt: true,
            ..RegisterRequest::default()
        },
        Some("cluster-secret"),
    );
    let assignment = tokio::time::timeout(Duration::from_secs(5), client.registered())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.group, "game");
    assert_eq!(assignment.key.as_deref().map(str::len), Some(32));

    let row = server.registry().store().get_host("game", assignment.id).unwrap().unwrap();
    assert_eq!(row.key, assignment.key);

    client.stop().await;
    server.shutdown().await;
}

// ── Reconnect ────────────────────────────────────────────────────

#[tokio::test]
async fn node_registers_once_the_server_comes_up() {
    // Reserve a port, then free it so the first connect attempts fail.
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let request = RegisterRequest {
        port: Some(7401),
        ..RegisterRequest::default()
    };
    let mut config = RegistrationConfig::new(addr.to_string(), request);
    config.reconnect_delay = Duration::from_millis(50);
    let client = RegistrationClient::start(config);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(client.assignment().is_none());

    let server = RegisterServer::start(RegisterServerConfig::new(addr.to_string()))
        .await
        .unwrap();
    assert_eq!(registered(&client).await, 0);

    client.stop().await;
    server.shutdown().await;
}

//! Integration tests for lbpool.
//!
//! These drive the engine through its public API with real loopback sockets.

use lbpool::backend::{
    BackendError, Cluster, ClusterOptions, ClusterRegistry, Node, NodeHealth, RequestIdentity,
};
use lbpool::config::{HealthCheckSettings, ProbeKind, load_config, parse_config};
use lbpool::frontend::{DatagramFrontend, FrontendListener};
use lbpool::metrics::MetricsCollector;
use lbpool::state::AppState;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

fn fast_checks() -> HealthCheckSettings {
    HealthCheckSettings {
        kind: ProbeKind::Tcp,
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(500),
        unhealthy_threshold: 1,
        healthy_threshold: 1,
    }
}

fn cluster(name: &str) -> Cluster {
    Cluster::new(
        name,
        ClusterOptions {
            health: fast_checks(),
            ..ClusterOptions::default()
        },
    )
}

/// Accept and immediately drop connections until aborted.
fn start_probe_target(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    })
}

/// Echo every stream back to its sender.
fn start_echo_server(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// Poll `condition` every 20ms for up to 10s.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ninety_nine_nodes_follow_listener_health() {
    // One listener on every loopback address; each node uses its own
    // 127.0.0.x address so the nodes stay distinct.
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let target = start_probe_target(listener);

    let cluster = cluster("ninety-nine");
    for i in 1..=99u8 {
        let address = SocketAddr::from(([127, 0, 0, i], port));
        cluster.add_node(Node::new(address, 1, -1).unwrap()).unwrap();
    }
    assert_eq!(cluster.len(), 99);

    assert!(eventually(|| cluster.online_nodes().len() == 99).await);
    assert!(cluster.nodes().iter().all(|n| n.health() == NodeHealth::Good));

    target.abort();
    let _ = target.await;

    assert!(eventually(|| cluster.online_nodes().is_empty()).await);
    assert!(cluster.nodes().iter().all(|n| n.health() == NodeHealth::Bad));
    assert!(matches!(
        cluster.pick(&RequestIdentity::new("10.0.0.1:1000".parse().unwrap())),
        Err(BackendError::NoBackendAvailable(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_starts_bad_until_first_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let target = start_probe_target(listener);

    let cluster = cluster("first-probe");
    let mut events = cluster.health().subscribe();
    let node = cluster.add_node(Node::new(address, 1, -1).unwrap()).unwrap();
    assert_eq!(node.health(), NodeHealth::Bad);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.node, address);
    assert_eq!((event.from, event.to), (NodeHealth::Bad, NodeHealth::Good));
    assert!(node.is_online());

    target.abort();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_removed_node_sees_no_further_transitions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let target = start_probe_target(listener);

    let cluster = cluster("removal");
    let mut events = cluster.health().subscribe();
    let node = cluster.add_node(Node::new(address, 1, -1).unwrap()).unwrap();
    assert!(eventually(|| node.is_online()).await);

    assert!(cluster.remove_node(address));
    assert!(!cluster.remove_node(address));
    assert!(!cluster.health().is_watching(address));
    while events.try_recv().is_ok() {}

    // The target going away would flip the node BAD if it were still probed
    target.abort();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(events.try_recv().is_err());
    assert_eq!(node.health(), NodeHealth::Good);
    assert!(cluster.node(address).is_none());

    cluster.shutdown().await;
}

#[test]
fn test_node_capacity_limit() {
    let node = Node::new("10.0.0.1:80".parse().unwrap(), 1, 5000).unwrap();
    for _ in 0..5000 {
        node.admit_connection().unwrap();
    }
    assert_eq!(
        node.admit_connection(),
        Err(BackendError::CapacityExceeded("10.0.0.1:80".parse().unwrap(), 5000))
    );
    assert_eq!(node.active_connections(), 5000);
}

#[test]
fn test_node_construction_rules() {
    let address: SocketAddr = "10.0.0.1:80".parse().unwrap();
    assert!(matches!(
        Node::new(address, 0, -1),
        Err(BackendError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        Node::new(address, 1, -2),
        Err(BackendError::InvalidConfiguration(_))
    ));
    assert!(Node::new(address, 1, 0).is_ok());
    assert!(Node::new(address, 1, -1).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_frontend_end_to_end() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let echo = start_echo_server(backend);

    let yaml = format!(
        r#"
clusters:
  - name: echo
    health_check: {{ interval: 100ms, timeout: 500ms, healthy_threshold: 1 }}
    nodes:
      - address: "{backend_addr}"
        max_connections: 10
frontends:
  - name: echo-tcp
    listen: "127.0.0.1:0"
    protocol: tcp
    cluster: echo
    tcp: {{ connect_timeout: 1s }}
"#
    );
    let config = parse_config(&yaml).unwrap();
    let state = AppState::new(config.clone()).unwrap();
    let node = state.registry().get("echo").unwrap().node(backend_addr).unwrap();
    assert!(eventually(|| node.is_online()).await);

    let listener = FrontendListener::bind(
        config.frontends[0].clone(),
        Arc::clone(state.registry()),
        state.metrics().clone(),
    )
    .await
    .unwrap();
    let front_addr = listener.local_addr().unwrap();
    let frontend = tokio::spawn(listener.run(state.shutdown().subscribe()));

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
    drop(client);

    assert!(eventually(|| node.active_connections() == 0 && node.bytes_received() == 4).await);
    assert_eq!(node.bytes_sent(), 4);
    assert_eq!(node.total_connections(), 1);

    let mut exposition = String::new();
    prometheus_client::encoding::text::encode(&mut exposition, state.metrics().registry()).unwrap();
    assert!(exposition.contains("lbpool_connections_total"));
    assert!(exposition.contains("lbpool_bytes_total"));

    state.stop().await;
    frontend.await.unwrap();
    echo.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_frontend_end_to_end() {
    // TCP probe target and UDP backend share one port number
    let probe_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = probe_listener.local_addr().unwrap();
    let probe_target = start_probe_target(probe_listener);
    let backend = UdpSocket::bind(backend_addr).await.unwrap();
    let udp_echo = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, from)) = backend.recv_from(&mut buf).await {
            let _ = backend.send_to(&buf[..n], from).await;
        }
    });

    let yaml = format!(
        r#"
clusters:
  - name: dns
    health_check: {{ interval: 100ms, timeout: 500ms }}
    nodes:
      - address: "{backend_addr}"
frontends:
  - name: dns-udp
    listen: "127.0.0.1:0"
    protocol: udp
    cluster: dns
    udp: {{ backlog_limit: 8, idle_timeout: 1s, reap_interval: 50ms, connect_timeout: 1s }}
"#
    );
    let config = parse_config(&yaml).unwrap();
    let state = AppState::new(config.clone()).unwrap();
    let node = state.registry().get("dns").unwrap().node(backend_addr).unwrap();
    assert!(eventually(|| node.is_online()).await);

    let frontend = DatagramFrontend::bind(
        config.frontends[0].clone(),
        Arc::clone(state.registry()),
        state.metrics().clone(),
    )
    .await
    .unwrap();
    let front_addr = frontend.local_addr().unwrap();
    let flows = Arc::clone(frontend.flows());
    let task = tokio::spawn(frontend.run(state.shutdown().subscribe()));

    let mut buf = [0u8; 64];
    for payload in [&b"first"[..], b"second"] {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(payload, front_addr).await.unwrap();
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], payload);
        assert_eq!(from, front_addr);
    }
    assert_eq!(flows.len(), 2);
    assert_eq!(node.active_connections(), 2);

    // Idle flows are reaped and release their admissions
    assert!(eventually(|| flows.is_empty() && node.active_connections() == 0).await);
    assert_eq!(node.bytes_sent(), 11);
    assert_eq!(node.bytes_received(), 11);

    state.stop().await;
    task.await.unwrap();
    probe_target.abort();
    udp_echo.abort();
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
global:
  log_level: debug
  log_format: pretty
clusters:
  - name: web
    algorithm: weighted
    persistence: {{ mode: source_ip, ttl: 1m }}
    health_check: {{ interval: 1h, timeout: 50ms }}
    nodes:
      - {{ address: "192.0.2.1:80", weight: 3 }}
      - {{ address: "192.0.2.2:80", max_connections: 100 }}
"#
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    let state = AppState::new(config).unwrap();
    let web = state.registry().get("web").unwrap();
    assert_eq!(web.algorithm_name(), "weighted_round_robin");
    assert_eq!(web.len(), 2);
    assert_eq!(web.node("192.0.2.1:80".parse().unwrap()).unwrap().weight(), 3);
    assert_eq!(
        web.node("192.0.2.2:80".parse().unwrap()).unwrap().max_connections(),
        100
    );
    state.stop().await;

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    writeln!(bad, "clusters:\n  - name: empty\n    nodes: []").unwrap();
    assert!(load_config(bad.path()).is_err());
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let registry = ClusterRegistry::new(MetricsCollector::new());
    registry.create_cluster("a", registry.options()).unwrap();
    assert!(matches!(
        registry.create_cluster("a", registry.options()),
        Err(BackendError::DuplicateCluster(_))
    ));

    let address: SocketAddr = "192.0.2.10:80".parse().unwrap();
    registry.add_node("a", Node::new(address, 1, -1).unwrap()).unwrap();
    assert_eq!(
        registry.remove_node("a", "192.0.2.11:80".parse().unwrap()),
        Err(BackendError::NodeNotFound("192.0.2.11:80".parse().unwrap(), "a".to_string()))
    );
    registry.remove_node("a", address).unwrap();

    let a = registry.get("a").unwrap();
    registry.remove_cluster("a").unwrap();
    assert!(a.is_closed());
    assert!(matches!(
        registry.pick("a", &RequestIdentity::new("10.0.0.1:1".parse().unwrap())),
        Err(BackendError::ClusterNotFound(_))
    ));
    registry.shutdown().await;
}

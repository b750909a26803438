use rustbalance::config::Config;
use rustbalance::server::{Server, Timings};
use rustbalance::upstream::Upstream;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn missing_config_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/config.yml").is_err());
}

#[test]
fn malformed_yaml_is_an_error() {
    let file = write_config("upstreams: [not: {valid");
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn generated_example_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");

    Config::create_example(&path).unwrap();
    let config = Config::from_file(&path).unwrap();

    assert_eq!(config.upstreams.len(), 1);
    assert_eq!(config.upstreams[0].name, "backends");
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].protocol, "udp");
}

#[tokio::test]
async fn loaded_config_drives_a_listener_end_to_end() {
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let file = write_config(&format!(
        r#"
upstreams:
  - name: pool
    targets:
      - "127.0.0.1:{backend_port}"
    hash: remote_ip
servers:
  - bind: "127.0.0.1"
    port: 0
    proto: udp
    pass: pool
"#,
        backend_port = backend_addr.port()
    ));
    let config = Config::from_file(file.path()).unwrap();

    let upstreams: Vec<Arc<Upstream>> = config
        .upstreams
        .iter()
        .map(|cfg| Upstream::from_config(cfg).map(Arc::new))
        .collect::<rustbalance::Result<_>>()
        .unwrap();

    let server = Arc::new(
        Server::bind_with(&config.servers[0], &upstreams, Timings::default())
            .await
            .unwrap(),
    );
    let listen_addr = server.local_addr().unwrap();
    server.clone().start();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"via-config", listen_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
        .await
        .expect("backend never saw the datagram")
        .unwrap();
    assert_eq!(&buf[..len], b"via-config");

    server.shutdown().await;
}

#[tokio::test]
async fn unresolvable_pass_target_fails_at_bind() {
    let file = write_config(
        r#"
servers:
  - bind: "127.0.0.1"
    port: 0
    proto: udp
    pass: no-such-upstream.invalid
"#,
    );
    let config = Config::from_file(file.path()).unwrap();

    assert!(Server::bind(&config.servers[0], &[]).await.is_err());
}

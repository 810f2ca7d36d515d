use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kushtaka_sensor::{Config, Hub, ServiceCatalogue, SharedRegistry, TcpSocketListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Read until `needle` shows up or the peer closes.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 512];
    timeout(Duration::from_secs(3), async {
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&output).contains(needle) {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for decoy output");
    String::from_utf8_lossy(&output).into_owned()
}

#[tokio::test]
async fn builtin_decoys_over_real_sockets() {
    let shared_port = free_port().await;
    let http_port = free_port().await;

    let ports = format!(
        r#"[
            {{"port": "tcp/127.0.0.1:{shared_port}", "services": ["ssh", "telnet"]}},
            {{"port": "tcp/127.0.0.1:{http_port}", "services": ["http"]}}
        ]"#
    );
    let vars = HashMap::from([
        ("KUSHTAKA_SENSOR_NAME".to_string(), "e2e".to_string()),
        ("KUSHTAKA_PEEK_WINDOW_MS".to_string(), "100".to_string()),
        ("KUSHTAKA_PORTS".to_string(), ports),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let registry = config.build_registry(&ServiceCatalogue::builtin()).unwrap();
    let registry = Arc::new(SharedRegistry::new(registry));
    let listener = TcpSocketListener::bind(registry.snapshot().addresses())
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = Arc::new(Hub::new(config.hub_config(), registry));
    let stats = hub.stats();
    let hub_handle = tokio::spawn(hub.run(listener, shutdown_rx));

    let shared: SocketAddr = ([127, 0, 0, 1], shared_port).into();
    let http: SocketAddr = ([127, 0, 0, 1], http_port).into();

    // SSH client on the shared port gets the SSH banner.
    let mut ssh = TcpStream::connect(shared).await.unwrap();
    ssh.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    let banner = read_until(&mut ssh, "\r\n").await;
    assert!(banner.starts_with("SSH-2.0-OpenSSH_8.9p1"), "{banner}");

    // A client that says nothing lands on the telnet fallback.
    let mut telnet = TcpStream::connect(shared).await.unwrap();
    let prompt = read_until(&mut telnet, "login: ").await;
    assert!(prompt.ends_with("login: "), "{prompt}");
    telnet.write_all(b"root\r\ntoor\r\nid\r\n").await.unwrap();
    let reply = read_until(&mut telnet, "command not found").await;
    assert!(reply.contains("-sh: id: command not found"), "{reply}");

    // Single-service port serves HTTP directly.
    let mut client = TcpStream::connect(http).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: sensor\r\n\r\n")
        .await
        .unwrap();
    let response = read_until(&mut client, "</html>").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), hub_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.connections_accepted, 3);
    assert_eq!(snapshot.no_service + snapshot.no_suitable_service, 0);
}

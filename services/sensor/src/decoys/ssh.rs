//! SSH decoy.
//!
//! Exchanges identification strings and records the client's, then closes
//! before key exchange. Enough to fingerprint scanners and brute-force
//! tooling.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::info;

use super::read_line;
use crate::dispatch::{BoxStream, DetectingServicer, Servicer, SessionContext};

/// SSH decoy.
#[derive(Debug, Clone)]
pub struct SshDecoy {
    /// Identification string sent to the client, without CRLF.
    pub banner: String,
}

impl Default for SshDecoy {
    fn default() -> Self {
        Self {
            banner: "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1".to_string(),
        }
    }
}

#[async_trait]
impl Servicer for SshDecoy {
    async fn handle(&self, ctx: SessionContext, stream: BoxStream) -> anyhow::Result<()> {
        let mut stream = BufReader::new(stream);

        stream
            .write_all(format!("{}\r\n", self.banner).as_bytes())
            .await?;

        // Clients may send other lines before the identification string.
        while let Some(line) = read_line(&mut stream).await? {
            if line.starts_with(b"SSH-") {
                info!(
                    decoy = "ssh",
                    sensor = %ctx.sensor_name,
                    peer_addr = %ctx.peer_addr,
                    client_version = %String::from_utf8_lossy(&line),
                    "Client identified"
                );
                break;
            }
        }

        stream.shutdown().await?;
        Ok(())
    }
}

impl DetectingServicer for SshDecoy {
    fn can_handle(&self, peeked: &[u8]) -> bool {
        peeked.starts_with(b"SSH-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    #[test]
    fn test_can_handle() {
        let decoy = SshDecoy::default();
        assert!(decoy.can_handle(b"SSH-2.0-libssh_0.9.6\r\n"));
        assert!(!decoy.can_handle(b"SSH"));
        assert!(!decoy.can_handle(b"GET / HTTP/1.1\r\n"));
        assert!(!decoy.can_handle(b""));
    }

    #[tokio::test]
    async fn test_exchanges_banners() {
        let (_tx, rx) = watch::channel(false);
        let ctx = SessionContext {
            sensor_name: "test".to_string(),
            peer_addr: "10.0.0.9:40000".parse().unwrap(),
            local_addr: "10.0.0.1:22".parse().unwrap(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            shutdown: rx,
        };

        let (mut client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(async move {
            SshDecoy::default().handle(ctx, Box::new(server)).await
        });

        client.write_all(b"SSH-2.0-Go\r\n").await.unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(output, b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1\r\n");
    }
}

//! HTTP decoy.
//!
//! Reads one request head, logs it, and answers with a static login page
//! dressed as an Apache-served admin panel.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::info;

use super::read_line;
use crate::dispatch::{BoxStream, DetectingServicer, Servicer, SessionContext};

/// Largest request head read before answering anyway.
const MAX_HEAD_BYTES: usize = 8 * 1024;

const METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"HEAD ", b"PUT ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

const LOGIN_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Login</title></head>\n<body>\n<form method=\"post\" action=\"/login\">\n<input name=\"username\" placeholder=\"Username\">\n<input name=\"password\" type=\"password\" placeholder=\"Password\">\n<button type=\"submit\">Sign in</button>\n</form>\n</body></html>\n";

/// HTTP decoy.
#[derive(Debug, Clone)]
pub struct HttpDecoy {
    /// Value of the `Server` response header.
    pub server_header: String,
}

impl Default for HttpDecoy {
    fn default() -> Self {
        Self {
            server_header: "Apache/2.4.52 (Ubuntu)".to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RequestHead {
    request_line: String,
    host: Option<String>,
    user_agent: Option<String>,
}

impl HttpDecoy {
    fn response(&self) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: text/html; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.server_header,
            LOGIN_PAGE.len(),
            LOGIN_PAGE
        )
    }
}

#[async_trait]
impl Servicer for HttpDecoy {
    async fn handle(&self, ctx: SessionContext, stream: BoxStream) -> anyhow::Result<()> {
        let mut stream = BufReader::new(stream);
        let mut head = RequestHead::default();
        let mut read = 0;

        while read < MAX_HEAD_BYTES {
            let Some(line) = read_line(&mut stream).await? else {
                break;
            };
            read += line.len() + 2;
            if line.is_empty() {
                break;
            }

            let line = String::from_utf8_lossy(&line).into_owned();
            if head.request_line.is_empty() {
                head.request_line = line;
            } else {
                parse_header(&mut head, &line);
            }
        }

        if head.request_line.is_empty() {
            return Ok(());
        }

        info!(
            decoy = "http",
            sensor = %ctx.sensor_name,
            peer_addr = %ctx.peer_addr,
            request = %head.request_line,
            host = head.host.as_deref().unwrap_or("-"),
            user_agent = head.user_agent.as_deref().unwrap_or("-"),
            "Request"
        );

        stream.write_all(self.response().as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

impl DetectingServicer for HttpDecoy {
    fn can_handle(&self, peeked: &[u8]) -> bool {
        METHODS.iter().any(|method| peeked.starts_with(method))
    }
}

fn parse_header(head: &mut RequestHead, line: &str) {
    let Some((name, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim().to_string();
    if name.eq_ignore_ascii_case("host") {
        head.host = Some(value);
    } else if name.eq_ignore_ascii_case("user-agent") {
        head.user_agent = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    #[test]
    fn test_can_handle() {
        let decoy = HttpDecoy::default();
        assert!(decoy.can_handle(b"GET / HTTP/1.1\r\n"));
        assert!(decoy.can_handle(b"OPTIONS * HTTP/1.1\r\n"));
        assert!(!decoy.can_handle(b"GET"));
        assert!(!decoy.can_handle(b"SSH-2.0-OpenSSH\r\n"));
        assert!(!decoy.can_handle(b"get / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_parse_header() {
        let mut head = RequestHead::default();
        parse_header(&mut head, "User-Agent: curl/8.0");
        parse_header(&mut head, "HOST:example.com ");
        parse_header(&mut head, "garbage");
        assert_eq!(head.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(head.host.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_serves_login_page() {
        let (_tx, rx) = watch::channel(false);
        let ctx = SessionContext {
            sensor_name: "test".to_string(),
            peer_addr: "10.0.0.9:40000".parse().unwrap(),
            local_addr: "10.0.0.1:80".parse().unwrap(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            shutdown: rx,
        };

        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            HttpDecoy::default().handle(ctx, Box::new(server)).await
        });

        client
            .write_all(b"GET /admin HTTP/1.1\r\nHost: sensor\r\nUser-Agent: zgrab\r\n\r\n")
            .await
            .unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        handle.await.unwrap().unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Server: Apache/2.4.52 (Ubuntu)\r\n"));
        assert!(output.ends_with(LOGIN_PAGE));
    }
}

//! Telnet decoy.
//!
//! Presents a login prompt, records the credentials, then fakes a shell that
//! answers every command with "command not found". Telnet option
//! negotiation from the client is stripped, never answered.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::info;

use super::read_line;
use crate::dispatch::{BoxStream, Servicer, SessionContext};

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;

/// IAC WILL ECHO, IAC WILL SUPPRESS-GO-AHEAD.
const NEGOTIATION: &[u8] = &[IAC, 251, 1, IAC, 251, 3];

/// Telnet decoy.
#[derive(Debug, Clone)]
pub struct TelnetDecoy {
    /// Hostname shown in the banner and prompt.
    pub hostname: String,
    /// Commands accepted before the fake shell hangs up.
    pub max_commands: usize,
}

impl Default for TelnetDecoy {
    fn default() -> Self {
        Self {
            hostname: "router".to_string(),
            max_commands: 32,
        }
    }
}

#[async_trait]
impl Servicer for TelnetDecoy {
    async fn handle(&self, ctx: SessionContext, stream: BoxStream) -> anyhow::Result<()> {
        let mut stream = BufReader::new(stream);

        stream.write_all(NEGOTIATION).await?;
        stream
            .write_all(format!("\r\n{} login: ", self.hostname).as_bytes())
            .await?;

        let Some(username) = read_line(&mut stream).await? else {
            return Ok(());
        };
        stream.write_all(b"Password: ").await?;
        let Some(password) = read_line(&mut stream).await? else {
            return Ok(());
        };

        info!(
            decoy = "telnet",
            sensor = %ctx.sensor_name,
            peer_addr = %ctx.peer_addr,
            username = %strip_commands(&username),
            password = %strip_commands(&password),
            "Login attempt"
        );

        let prompt = format!("\r\n{}:~$ ", self.hostname);
        stream.write_all(prompt.as_bytes()).await?;

        for _ in 0..self.max_commands {
            let Some(line) = read_line(&mut stream).await? else {
                return Ok(());
            };
            let command = strip_commands(&line);
            let command = command.trim();
            if command.is_empty() {
                stream.write_all(prompt.as_bytes()).await?;
                continue;
            }

            info!(
                decoy = "telnet",
                peer_addr = %ctx.peer_addr,
                command = %command,
                "Command"
            );

            if matches!(command, "exit" | "logout" | "quit") {
                break;
            }

            let program = command.split_whitespace().next().unwrap_or(command);
            let reply = format!("-sh: {program}: command not found{prompt}");
            stream.write_all(reply.as_bytes()).await?;
        }

        stream.shutdown().await?;
        Ok(())
    }
}

/// Drop telnet command sequences and decode the rest lossily.
fn strip_commands(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied();

    while let Some(byte) = iter.next() {
        if byte != IAC {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(IAC) => out.push(IAC),
            Some(SB) => {
                // Subnegotiation runs until IAC SE.
                let mut prev = 0;
                for b in iter.by_ref() {
                    if prev == IAC && b == SE {
                        break;
                    }
                    prev = b;
                }
            }
            // WILL/WONT/DO/DONT carry one option byte.
            Some(251..=254) => {
                iter.next();
            }
            _ => {}
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

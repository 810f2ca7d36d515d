//! Built-in decoy services and the name → service catalogue.
//!
//! The decoys here are thin: they present a believable greeting, record what
//! the peer sends as structured log events, and hang up. Port configuration
//! refers to them by catalogue name.

mod http;
mod ssh;
mod telnet;

use std::collections::BTreeMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub use http::HttpDecoy;
pub use ssh::SshDecoy;
pub use telnet::TelnetDecoy;

use crate::dispatch::DecoyService;

/// Longest line a decoy will buffer from a peer.
const MAX_LINE_BYTES: usize = 4096;

/// Named decoy services available to port configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalogue {
    services: BTreeMap<String, DecoyService>,
}

impl ServiceCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with every built-in decoy.
    pub fn builtin() -> Self {
        let mut catalogue = Self::new();
        catalogue.insert("telnet", DecoyService::unconditional(TelnetDecoy::default()));
        catalogue.insert("ssh", DecoyService::detecting(SshDecoy::default()));
        catalogue.insert("http", DecoyService::detecting(HttpDecoy::default()));
        catalogue
    }

    pub fn insert(&mut self, name: impl Into<String>, service: DecoyService) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<&DecoyService> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Read one line (without its terminator), lossily decoded.
///
/// Returns `None` at end of stream. Lines longer than the limit are cut.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    while matches!(line.last(), Some(b'\n' | b'\r' | 0)) {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_builtin_catalogue() {
        let catalogue = ServiceCatalogue::builtin();
        assert_eq!(catalogue.names().collect::<Vec<_>>(), ["http", "ssh", "telnet"]);
        assert!(!catalogue.get("telnet").unwrap().is_detecting());
        assert!(catalogue.get("ssh").unwrap().is_detecting());
        assert!(catalogue.get("ftp").is_none());
    }

    #[tokio::test]
    async fn test_read_line() {
        let mut reader = BufReader::new(&b"root\r\nsecret\n"[..]);
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), b"root");
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), b"secret");
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }
}

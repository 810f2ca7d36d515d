//! Protocol resolution.
//!
//! Picks the one binding that serves a connection:
//! - No candidates: the connection is refused.
//! - One candidate: it wins without touching the stream.
//! - Several: the first bytes are peeked once and offered to the detecting
//!   candidates in registration order; unconditional candidates only win
//!   after every detecting one declined.

use kushtaka_networking::Address;
use tracing::debug;

use super::peek::{PeekConfig, PeekedStream};
use super::registry::{Binding, Registry};
use super::service::{BoxStream, DecoyService, Stream};
use crate::error::ResolveError;

/// Outcome of a successful resolution.
pub struct Resolution {
    /// The winning binding.
    pub binding: Binding,
    /// Stream to hand to the binding's decoy. Replays any peeked bytes.
    pub stream: BoxStream,
    /// Bytes captured by the peek, or `None` on the single-candidate path.
    pub peeked: Option<usize>,
}

/// Resolves connections against a registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProtocolResolver {
    peek: PeekConfig,
}

impl ProtocolResolver {
    pub fn new(peek: PeekConfig) -> Self {
        Self { peek }
    }

    pub fn peek_config(&self) -> &PeekConfig {
        &self.peek
    }

    /// Select the binding for a connection on `address`.
    ///
    /// `stream` should already carry the session deadline; the peek read is
    /// bounded by it. On error the stream is dropped, closing the connection.
    pub async fn resolve<S: Stream + 'static>(
        &self,
        registry: &Registry,
        address: &Address,
        stream: S,
    ) -> Result<Resolution, ResolveError> {
        let candidates = registry.lookup(address);

        match candidates {
            [] => Err(ResolveError::NoService {
                address: address.to_string(),
            }),
            [only] => Ok(Resolution {
                binding: only.clone(),
                stream: Box::new(stream),
                peeked: None,
            }),
            _ => {
                debug!(
                    address = %address,
                    candidates = candidates.len(),
                    "Peeking connection"
                );

                let mut peeked = PeekedStream::new(stream);
                let captured = peeked.peek(&self.peek).await.map_err(ResolveError::Peek)?;
                let captured_len = captured.len();

                let binding = select_candidate(candidates, captured)
                    .cloned()
                    .ok_or_else(|| ResolveError::NoSuitableService {
                        address: address.to_string(),
                        candidates: candidates.len(),
                    })?;

                Ok(Resolution {
                    binding,
                    stream: Box::new(peeked),
                    peeked: Some(captured_len),
                })
            }
        }
    }
}

/// Pick the candidate for a connection that opened with `peeked`.
///
/// Detecting candidates are asked in order and the first claim wins. If none
/// claims it, the first unconditional candidate is the fallback.
pub fn select_candidate<'a>(candidates: &'a [Binding], peeked: &[u8]) -> Option<&'a Binding> {
    let detected = candidates.iter().find(|binding| match &binding.service {
        DecoyService::Detecting(service) => service.can_handle(peeked),
        DecoyService::Unconditional(_) => false,
    });

    detected.or_else(|| {
        candidates
            .iter()
            .find(|binding| !binding.service.is_detecting())
    })
}

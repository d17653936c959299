use std::io;

use crate::peer::PeerId;

/// Result type used throughout the crate.
pub type HubResult<T> = Result<T, HubError>;

/// The error kinds named in the server's error handling design.
///
/// Every per-peer error is recovered locally by the caller; only `Fatal`
/// should ever propagate out of the run loop.
#[derive(thiserror::Error, Debug)]
pub enum HubError {
    /// Registry full; the connecting peer is sent an abort frame and dropped.
    #[error("peer registry at capacity, rejecting connection")]
    CapacityExceeded,

    /// Notifier or fd allocation failed (e.g. process fd limit reached).
    #[error("resource exhausted while {operation}: {source}")]
    ResourceExhaustion {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Partial read/write, broken pipe, or other transport failure for a
    /// specific peer. Never propagated to other peers.
    #[error("transport error for peer {peer:?}: {source}")]
    Transport {
        peer: Option<PeerId>,
        #[source]
        source: io::Error,
    },

    /// A connected peer sent bytes on the stream socket after handshake.
    #[error("peer {peer:?} sent unexpected post-handshake bytes")]
    ProtocolMisuse { peer: PeerId },

    /// A mailbox payload exceeded the slot's payload capacity and was
    /// truncated. Not a failure: the call still succeeds.
    #[error("message for slot {slot} truncated from {given} to {allowed} bytes")]
    Truncation {
        slot: u32,
        given: usize,
        allowed: usize,
    },

    /// A failure that precludes serving any peer at all: listen-socket bind
    /// failure or shared-memory creation failure. The process terminates
    /// after logging this.
    #[error("fatal error during {operation}: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl HubError {
    pub fn fatal(operation: &'static str, source: io::Error) -> HubError {
        HubError::Fatal { operation, source }
    }

    pub fn resource_exhaustion(operation: &'static str, source: io::Error) -> HubError {
        HubError::ResourceExhaustion { operation, source }
    }

    pub fn transport(peer: Option<PeerId>, source: io::Error) -> HubError {
        HubError::Transport { peer, source }
    }
}

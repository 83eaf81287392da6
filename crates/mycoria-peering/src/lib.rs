//! # mycoria-peering
//!
//! Everything between a byte stream and a routable peer: peering URLs, the
//! three-message mutual-authentication handshake, the sealed link-frame
//! protocol with its priority/regular send queues, the transport contract,
//! and the link manager with its auto-connect loop.
//!
//! ## Modules
//!
//! - [`url`] — peering URL parsing and stable ordering
//! - [`protocol`] — handshake messages and the handshake state machine
//! - [`linkframe`] — length-prefixed sealed link frames
//! - [`link`] — one live link: reader/writer tasks, queues, latency
//! - [`transport`] — the transport contract and the TCP transport
//! - [`manager`] — link registries, listeners, the connect loop

pub mod link;
pub mod linkframe;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod url;

pub use link::Link;
pub use manager::LinkManager;
pub use protocol::{Handshake, HandshakeConfig, PeeringMsg};
pub use url::PeeringUrl;

/// Error types for peering operations.
#[derive(Debug, thiserror::Error)]
pub enum PeeringError {
    /// The peer denied the peering and sent a reason.
    #[error("remote denied peering: {0}")]
    RemoteDeniedPeering(String),

    /// The peer lives in a different universe (or failed universe auth).
    #[error("universe mismatch: {0}")]
    UniverseMismatch(String),

    /// Reading from the network failed; the link closes.
    #[error("network read error: {0}")]
    NetworkReadError(String),

    /// Writing to the network failed; the link closes.
    #[error("network write error: {0}")]
    NetworkWriteError(String),

    /// A peering URL could not be parsed.
    #[error("invalid peering URL: {0}")]
    InvalidUrl(String),

    /// The handshake violated the protocol.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Frame-layer failure during peering.
    #[error(transparent)]
    Frame(#[from] mycoria_frame::FrameError),

    /// Session-layer failure during peering.
    #[error(transparent)]
    Session(#[from] mycoria_session::SessionError),
}

pub type Result<T> = std::result::Result<T, PeeringError>;

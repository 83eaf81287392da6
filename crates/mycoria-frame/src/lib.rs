//! # mycoria-frame
//!
//! The versioned wire frame: a 44-byte header, the mutable switch block,
//! and the sealed (or signed) message and appendix regions.
//!
//! ```text
//! 0      : version (u8) = 1
//! 1      : ttl (u8)
//! 2      : flow_flags:4 | message_type:4
//! 3      : recv_rate (u8, 0..=100)
//! 4..8   : sequence_num (u32 BE)
//! 8..12  : sequence_ack (u32 BE)
//! 12..28 : src (16 bytes)
//! 28..44 : dst (16 bytes)
//! 44..   : varint-prefixed switch block
//!        + varint-prefixed message data
//!        + varint-prefixed appendix data
//!        + 16-byte authentication tag
//! ```
//!
//! The switch block rotates at every hop, so neither the end-to-end seal nor
//! the end-to-end signature covers it; the TTL byte is zeroed for nonce, AAD
//! and signature computation for the same reason.
//!
//! ## Modules
//!
//! - [`frame`] — frame layout, parse/build, seal/unseal, sign/verify
//! - [`builder`] — pooled buffers for per-packet allocation avoidance
//! - [`varint`] — length-prefix varint codec

pub mod builder;
pub mod frame;
pub mod varint;

pub use builder::FrameBuilder;
pub use frame::{FlowFlags, Frame, FrameOpts, MessageType};

/// Error types for frame operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame's version byte is not supported.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// A buffer or region is too small.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufTooSmall { need: usize, have: usize },

    /// The frame is structurally invalid.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A session-layer failure: sequence check, missing keys, bad signature.
    #[error(transparent)]
    Session(#[from] mycoria_session::SessionError),
}

pub type Result<T> = std::result::Result<T, FrameError>;

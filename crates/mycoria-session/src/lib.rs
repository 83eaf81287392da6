//! # mycoria-session
//!
//! Per-peer cryptographic sessions: the Ed25519 signing session with its
//! millisecond time sequence, and the duplex ChaCha20-Poly1305 AEAD session
//! with replay windows and automatic key rollover.
//!
//! One [`session::Session`] exists per remote router, held in the shared
//! [`session::SessionManager`] map. Sessions clean themselves up after an
//! hour of inactivity, or after a minute when encryption setup never
//! completed.
//!
//! ## Modules
//!
//! - [`kdf`] — X25519 exchange and the BLAKE3 key-derivation contexts
//! - [`sequence`] — time and integer sequences with replay protection
//! - [`aead`] — the duplex AEAD session with priority/regular handlers
//! - [`signing`] — the Ed25519 signing session
//! - [`session`] — per-remote session records and the manager

pub mod aead;
pub mod kdf;
pub mod sequence;
pub mod session;
pub mod signing;

pub use aead::AeadSession;
pub use session::{Session, SessionManager};
pub use signing::SigningSession;

/// Error types for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureFailure,

    /// The AEAD session has no keys yet.
    #[error("encryption is not set up")]
    EncryptionNotSetUp,

    /// The sequence number equals the highest already seen.
    #[error("immediate duplicate frame")]
    ImmediateDuplicateFrame,

    /// The sequence number falls inside the replay window and was already
    /// seen.
    #[error("delayed duplicate frame")]
    DelayedDuplicateFrame,

    /// The sequence number falls behind the replay window.
    #[error("delayed frame")]
    DelayedFrame,

    /// A signed timestamp lies too far in the past.
    #[error("frame too old")]
    TooOldFrame,

    /// A signed timestamp lies too far in the future.
    #[error("frame too new")]
    TooNewFrame,

    /// Key derivation produced unusable output.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD open failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,
}

pub type Result<T> = std::result::Result<T, SessionError>;

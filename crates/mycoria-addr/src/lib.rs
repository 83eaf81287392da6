//! # mycoria-addr
//!
//! The Mycoria address plane: the deterministic mapping between a router's
//! long-term public key and its 128-bit overlay address in `fd00::/8`.
//!
//! An address is the truncated BLAKE3 digest of the router's public key
//! (plus an optional "easing" nonce), so the address space is claimed by
//! brute force: key or nonce candidates are scanned until the digest lands
//! in the desired geo-marked prefix.
//!
//! ## Modules
//!
//! - [`address`] — key-to-address derivation, verification, identities
//! - [`classify`] — address-type classification and routing granularity
//! - [`geo`] — the static geo-marker prefix table and country lookup
//! - [`generate`] — address generation, including the parallel scanner
//! - [`prefix`] — IPv6 prefix arithmetic shared by the address plane

pub mod address;
pub mod classify;
pub mod generate;
pub mod geo;
pub mod prefix;

pub use address::{PrivateIdentity, RouterAddress, HashAlg, KeyType};
pub use classify::{AddressType, Continent, Region};
pub use generate::GenerateConfig;
pub use prefix::Prefix;

/// Error types for address-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    /// Address generation exhausted its scan budget.
    #[error("max tries reached while searching for a matching address")]
    MaxTriesReached,

    /// The address does not belong to this identity or is malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The public key bytes are not a valid key of the declared type.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A generation worker failed.
    #[error("generation worker failed: {0}")]
    WorkerFailed(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

//! Key-to-address derivation and router identities.
//!
//! An address is the first 16 bytes of a BLAKE3 digest over a fixed prelude
//! of the router's public key:
//!
//! ```text
//! [version=1 u8][len(key_type) u8][len(public_key) u16 BE]
//! [key_type bytes][public_key bytes][easing u64 BE, only when easing > 0]
//! ```
//!
//! The digest is recomputable by anyone holding the public key and the
//! recorded easing nonce, so address ownership is verified rather than
//! registered.

use std::net::Ipv6Addr;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::prefix::{INTERNAL_PREFIX, MYCORIA_PREFIX};
use crate::{AddrError, Result};

/// Version byte of the digest prelude.
const DIGEST_VERSION: u8 = 1;

/// Hash algorithm used for address derivation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlg {
    #[default]
    Blake3,
}

impl HashAlg {
    /// The identifier recorded alongside persisted identities.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlg::Blake3 => "BLAKE3",
        }
    }
}

/// Signature key type used for router identities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    Ed25519,
}

impl KeyType {
    /// The identifier hashed into the digest prelude.
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "Ed25519",
        }
    }
}

/// A router's public address record: the overlay IP together with everything
/// needed to recompute and verify it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterAddress {
    /// The overlay IP in `fd00::/8`.
    pub ip: Ipv6Addr,
    /// Hash algorithm of the derivation digest.
    pub hash: HashAlg,
    /// Signature key type.
    pub key_type: KeyType,
    /// The long-term Ed25519 verifying key.
    pub public_key: ed25519_dalek::VerifyingKey,
    /// Easing nonce appended to the digest input; 0 means absent.
    pub easing: u64,
}

impl RouterAddress {
    /// Recompute the digest and check it against the recorded IP.
    ///
    /// The 16-byte comparison is branch-free so timing does not leak how
    /// many leading bytes matched.
    pub fn verify(&self) -> Result<()> {
        verify_address(
            self.ip,
            self.public_key.as_bytes(),
            self.key_type,
            self.hash,
            self.easing,
        )
    }

    /// Verify a detached Ed25519 signature made by this router.
    pub fn verify_sig(&self, message: &[u8], signature: &ed25519_dalek::Signature) -> Result<()> {
        self.public_key
            .verify(message, signature)
            .map_err(|_| AddrError::InvalidAddress("signature does not match public key".into()))
    }
}

/// A router's private identity: the signing key plus the derived address.
///
/// The signing key material is wiped on drop.
pub struct PrivateIdentity {
    signing_key: ed25519_dalek::SigningKey,
    address: RouterAddress,
}

impl Drop for PrivateIdentity {
    fn drop(&mut self) {
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
    }
}

impl PrivateIdentity {
    /// Reconstruct an identity from a persisted signing key and easing nonce.
    ///
    /// The address is re-derived; a record that fails re-derivation was
    /// corrupted or tampered with.
    pub fn from_parts(secret: &[u8; 32], easing: u64) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(secret);
        let public_key = signing_key.verifying_key();
        let ip = derive_address(
            public_key.as_bytes(),
            KeyType::Ed25519,
            HashAlg::Blake3,
            easing,
        );
        Self {
            signing_key,
            address: RouterAddress {
                ip,
                hash: HashAlg::Blake3,
                key_type: KeyType::Ed25519,
                public_key,
                easing,
            },
        }
    }

    /// Assemble an identity from a freshly generated key (used by the
    /// address scanner).
    pub(crate) fn from_generated(signing_key: ed25519_dalek::SigningKey, easing: u64, ip: Ipv6Addr) -> Self {
        let public_key = signing_key.verifying_key();
        Self {
            signing_key,
            address: RouterAddress {
                ip,
                hash: HashAlg::Blake3,
                key_type: KeyType::Ed25519,
                public_key,
                easing,
            },
        }
    }

    /// The public address record.
    pub fn address(&self) -> &RouterAddress {
        &self.address
    }

    /// The overlay IP.
    pub fn ip(&self) -> Ipv6Addr {
        self.address.ip
    }

    /// Sign a message with the router's long-term key.
    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(message)
    }

    /// The raw signing-key bytes, for persistence. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl std::fmt::Debug for PrivateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateIdentity")
            .field("ip", &self.address.ip)
            .finish()
    }
}

/// Derive the overlay address for a public key.
pub fn derive_address(public_key: &[u8], key_type: KeyType, hash: HashAlg, easing: u64) -> Ipv6Addr {
    let HashAlg::Blake3 = hash;
    let digest = digest_input(public_key, key_type, easing);
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&digest.as_bytes()[..16]);
    Ipv6Addr::from(ip)
}

/// Verify that `ip` is the address of `public_key`.
///
/// Fails for addresses outside `fd00::/8`, addresses inside the internal
/// prefix, and digest mismatches.
pub fn verify_address(
    ip: Ipv6Addr,
    public_key: &[u8],
    key_type: KeyType,
    hash: HashAlg,
    easing: u64,
) -> Result<()> {
    if !MYCORIA_PREFIX.contains(ip) {
        return Err(AddrError::InvalidAddress(format!("{ip} is not in fd00::/8")));
    }
    if INTERNAL_PREFIX.contains(ip) {
        return Err(AddrError::InvalidAddress(format!(
            "{ip} is in the internal prefix"
        )));
    }

    let HashAlg::Blake3 = hash;
    let digest = digest_input(public_key, key_type, easing);

    // Branch-free compare of the first 16 digest bytes against the address.
    let expected = &digest.as_bytes()[..16];
    let actual = ip.octets();
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(actual.iter()) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return Err(AddrError::InvalidAddress(format!(
            "{ip} does not match the public key digest"
        )));
    }
    Ok(())
}

fn digest_input(public_key: &[u8], key_type: KeyType, easing: u64) -> blake3::Hash {
    let name = key_type.name().as_bytes();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[DIGEST_VERSION]);
    hasher.update(&[name.len() as u8]);
    hasher.update(&(public_key.len() as u16).to_be_bytes());
    hasher.update(name);
    hasher.update(public_key);
    if easing > 0 {
        hasher.update(&easing.to_be_bytes());
    }
    hasher.finalize()
}

//! X25519 key agreement and BLAKE3 key derivation.
//!
//! Context strings are byte-exact protocol constants, padded to 32 bytes —
//! the trailing space in the rollover context is significant. Using any
//! other context is a protocol violation.

use zeroize::{Zeroize, Zeroizing};

use crate::{Result, SessionError};

/// Context for deriving the initial duplex key pair from a fresh exchange.
pub const CONTEXT_INITIAL_SETUP: &str = "mycoria key exch - initial setup";

/// Context for rolling an existing key over; note the trailing space.
pub const CONTEXT_KEY_ROLLOVER: &str = "mycoria key exch - key rollover ";

/// Prefix for purpose-bound extra keys; the purpose string is appended.
pub const CONTEXT_EXTRA_KEYS_PREFIX: &str = "mycoria key exch - extra keys - ";

/// Purpose string of the link-layer AEAD session.
pub const PURPOSE_LINK_LAYER: &str = "link layer crypt";

/// The full context for purpose-bound extra keys.
pub fn extra_keys_context(purpose: &str) -> String {
    format!("{CONTEXT_EXTRA_KEYS_PREFIX}{purpose}")
}

/// A duplex key pair derived from one shared secret.
pub struct DuplexKeys {
    /// Key for frames this router receives.
    pub in_key: Zeroizing<[u8; 32]>,
    /// Key for frames this router sends.
    pub out_key: Zeroizing<[u8; 32]>,
}

/// Derive the duplex ChaCha20-Poly1305 keys for a session.
///
/// Expands the shared secret to 64 bytes under `context` and splits it in
/// half. Both peers call this with the same secret and context; the `client`
/// flag swaps the halves so one side's out-key is the other's in-key.
/// Derivation fails if the two halves come out equal.
pub fn derive_duplex_keys(shared_secret: &[u8; 32], context: &str, client: bool) -> Result<DuplexKeys> {
    let mut okm = Zeroizing::new([0u8; 64]);
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(shared_secret);
    hasher.finalize_xof().fill(okm.as_mut());

    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);

    if *first == *second {
        return Err(SessionError::KeyDerivation(
            "derived key halves are equal".into(),
        ));
    }

    let (out_key, in_key) = if client { (first, second) } else { (second, first) };
    Ok(DuplexKeys { in_key, out_key })
}

/// Roll a key over: `new = KDF(rollover context, old)`.
pub fn rollover_key(old: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut new = Zeroizing::new([0u8; 32]);
    let mut hasher = blake3::Hasher::new_derive_key(CONTEXT_KEY_ROLLOVER);
    hasher.update(old);
    new.copy_from_slice(hasher.finalize().as_bytes());
    new
}

/// An in-flight X25519 exchange: the local ephemeral secret, wiped after
/// the shared secret is taken.
pub struct KeyExchange {
    secret: x25519_dalek::StaticSecret,
    public: [u8; 32],
}

impl KeyExchange {
    /// Generate a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// The public key to send to the peer.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Consume the exchange and compute the shared secret with the peer's
    /// public key. The ephemeral secret is zeroized on drop.
    pub fn agree(self, remote_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let remote = x25519_dalek::PublicKey::from(*remote_public);
        let mut shared = Zeroizing::new([0u8; 32]);
        let mut raw = self.secret.diffie_hellman(&remote).to_bytes();
        shared.copy_from_slice(&raw);
        raw.zeroize();
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_strings_are_32_byte_aligned() {
        assert_eq!(CONTEXT_INITIAL_SETUP.len(), 32);
        assert_eq!(CONTEXT_KEY_ROLLOVER.len(), 32);
        assert_eq!(CONTEXT_EXTRA_KEYS_PREFIX.len(), 32);
        assert!(CONTEXT_KEY_ROLLOVER.ends_with(' '));
        assert_eq!(
            extra_keys_context(PURPOSE_LINK_LAYER),
            "mycoria key exch - extra keys - link layer crypt"
        );
    }

    #[test]
    fn test_exchange_agrees() {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        let shared_a = a.agree(&b_pub);
        let shared_b = b.agree(&a_pub);
        assert_eq!(*shared_a, *shared_b);
    }

    #[test]
    fn test_duplex_keys_swap_roles() {
        let shared = [0x11u8; 32];
        let client = derive_duplex_keys(&shared, CONTEXT_INITIAL_SETUP, true).expect("derive");
        let server = derive_duplex_keys(&shared, CONTEXT_INITIAL_SETUP, false).expect("derive");
        assert_eq!(*client.out_key, *server.in_key);
        assert_eq!(*client.in_key, *server.out_key);
        assert_ne!(*client.out_key, *client.in_key);
    }

    #[test]
    fn test_contexts_separate_keys() {
        let shared = [0x22u8; 32];
        let initial = derive_duplex_keys(&shared, CONTEXT_INITIAL_SETUP, true).expect("derive");
        let link = derive_duplex_keys(&shared, &extra_keys_context(PURPOSE_LINK_LAYER), true)
            .expect("derive");
        assert_ne!(*initial.out_key, *link.out_key);
    }

    #[test]
    fn test_rollover_changes_key() {
        let old = [0x33u8; 32];
        let new = rollover_key(&old);
        assert_ne!(*new, old);
        // Deterministic.
        assert_eq!(*rollover_key(&old), *new);
    }
}

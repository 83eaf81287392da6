//! The Ed25519 signing session.
//!
//! Signed frames carry a millisecond timestamp from the session's
//! [`TimeSequence`]; verification binds the signature to the remote's
//! long-term key and rejects replayed or reordered timestamps.

use std::sync::Arc;

use mycoria_addr::{PrivateIdentity, RouterAddress};

use crate::sequence::TimeSequence;
use crate::{Result, SessionError};

/// A signing session between the local router and one remote.
pub struct SigningSession {
    local: Arc<PrivateIdentity>,
    remote: RouterAddress,
    sequence: TimeSequence,
}

impl SigningSession {
    pub fn new(local: Arc<PrivateIdentity>, remote: RouterAddress) -> Self {
        Self {
            local,
            remote,
            sequence: TimeSequence::new(),
        }
    }

    /// The remote's address record.
    pub fn remote(&self) -> &RouterAddress {
        &self.remote
    }

    /// Next outgoing signed-frame timestamp, truncated to the wire width.
    pub fn next_sequence(&self) -> u32 {
        self.sequence.next_u32()
    }

    /// Check an incoming signed-frame timestamp.
    pub fn check_sequence(&self, t: u32) -> Result<()> {
        self.sequence.check(t)
    }

    /// Sign with the local long-term key.
    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.local.sign(message)
    }

    /// Verify a signature from the remote.
    pub fn verify(&self, message: &[u8], signature: &ed25519_dalek::Signature) -> Result<()> {
        self.remote
            .verify_sig(message, signature)
            .map_err(|_| SessionError::SignatureFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoria_addr::address::PrivateIdentity;

    fn identity(seed: u8) -> Arc<PrivateIdentity> {
        Arc::new(PrivateIdentity::from_parts(&[seed; 32], 0))
    }

    fn session_pair() -> (SigningSession, SigningSession) {
        let a = identity(1);
        let b = identity(2);
        let a_to_b = SigningSession::new(a.clone(), b.address().clone());
        let b_to_a = SigningSession::new(b, a.address().clone());
        (a_to_b, b_to_a)
    }

    #[test]
    fn test_sign_verify_across_sessions() {
        let (a_to_b, b_to_a) = session_pair();
        let sig = a_to_b.sign(b"peering request");
        assert!(b_to_a.verify(b"peering request", &sig).is_ok());
        assert!(b_to_a.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let (a_to_b, _) = session_pair();
        let c = identity(3);
        let sig = c.sign(b"peering request");
        assert!(a_to_b.verify(b"peering request", &sig).is_err());
    }

    #[test]
    fn test_sequence_flow() {
        let (a_to_b, b_to_a) = session_pair();
        let s1 = a_to_b.next_sequence();
        let s2 = a_to_b.next_sequence();
        assert!(s2 > s1);
        assert!(b_to_a.check_sequence(s1).is_ok());
        assert!(b_to_a.check_sequence(s1).is_err());
        assert!(b_to_a.check_sequence(s2).is_ok());
    }
}

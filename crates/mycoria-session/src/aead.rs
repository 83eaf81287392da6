//! The duplex AEAD session.
//!
//! Each session owns one in-key and one out-key for ChaCha20-Poly1305 plus
//! two independent sequence handlers, priority and regular. Keys roll over
//! automatically: the sender re-derives its out-key when the regular counter
//! wraps, and the receiver re-derives its in-key the first time it
//! authenticates a small sequence after the sender approached the wrap.
//! A regular rollover also resets the priority handler so its numbering
//! restarts under the new key.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use chacha20poly1305::{aead::KeyInit, ChaCha20Poly1305, Key};
use zeroize::Zeroizing;

use crate::kdf::{derive_duplex_keys, rollover_key, KeyExchange};
use crate::sequence::{SeqInbound, SeqOutbound};
use crate::{Result, SessionError};

/// Sequence, acknowledgement and receive-rate stamp for an outgoing frame.
#[derive(Clone, Copy, Debug)]
pub struct OutParams {
    pub seq: u32,
    pub ack: u32,
    pub recv_rate: u8,
    /// The out-key was rolled for this frame.
    pub rollover: bool,
}

/// An outgoing sequence paired with the cipher that must seal it.
///
/// The pair is taken under one lock acquisition so a concurrent rollover
/// can never split them.
pub struct OutSeal {
    pub params: OutParams,
    pub cipher: ChaCha20Poly1305,
}

/// Ciphers for opening an incoming frame.
pub struct InCiphers {
    pub current: ChaCha20Poly1305,
    /// Present when the sequence hints at a sender-side key rollover; tried
    /// when the current cipher rejects the frame. Committed only after it
    /// authenticates, so forged sequences cannot desynchronize the keys.
    pub rollover_candidate: Option<ChaCha20Poly1305>,
}

struct DirectionKeys {
    in_key: Zeroizing<[u8; 32]>,
    out_key: Zeroizing<[u8; 32]>,
    in_cipher: ChaCha20Poly1305,
    out_cipher: ChaCha20Poly1305,
}

impl DirectionKeys {
    fn new(in_key: Zeroizing<[u8; 32]>, out_key: Zeroizing<[u8; 32]>) -> Self {
        let in_cipher = ChaCha20Poly1305::new(Key::from_slice(in_key.as_ref()));
        let out_cipher = ChaCha20Poly1305::new(Key::from_slice(out_key.as_ref()));
        Self {
            in_key,
            out_key,
            in_cipher,
            out_cipher,
        }
    }

    fn roll_out(&mut self) {
        self.out_key = rollover_key(&self.out_key);
        self.out_cipher = ChaCha20Poly1305::new(Key::from_slice(self.out_key.as_ref()));
    }

    fn roll_in(&mut self) {
        self.in_key = rollover_key(&self.in_key);
        self.in_cipher = ChaCha20Poly1305::new(Key::from_slice(self.in_key.as_ref()));
    }
}

#[derive(Default)]
struct AeadState {
    kx: Option<KeyExchange>,
    keys: Option<DirectionKeys>,
    regular_out: SeqOutbound,
    priority_out: SeqOutbound,
    regular_in: SeqInbound,
    priority_in: SeqInbound,
}

/// A duplex AEAD session with a peer.
pub struct AeadSession {
    state: Mutex<AeadState>,
    recv_rate: AtomicU8,
}

impl Default for AeadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AeadSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AeadState::default()),
            recv_rate: AtomicU8::new(100),
        }
    }

    /// Start (or continue) the key exchange, returning the local ephemeral
    /// public key to send to the peer.
    pub fn init_kx(&self) -> [u8; 32] {
        let mut state = self.lock();
        let kx = state.kx.get_or_insert_with(KeyExchange::generate);
        kx.public_key()
    }

    /// Finish the key exchange with the peer's ephemeral public key and
    /// derive the duplex keys under `context`. The ephemeral secret is
    /// consumed and wiped.
    pub fn complete_kx(&self, remote_public: &[u8; 32], context: &str, client: bool) -> Result<()> {
        let mut state = self.lock();
        let kx = state.kx.take().ok_or(SessionError::EncryptionNotSetUp)?;
        let shared = kx.agree(remote_public);
        let duplex = derive_duplex_keys(&shared, context, client)?;
        state.keys = Some(DirectionKeys::new(duplex.in_key, duplex.out_key));
        Ok(())
    }

    /// Whether keys are derived and frames can be sealed.
    pub fn is_ready(&self) -> bool {
        self.lock().keys.is_some()
    }

    /// Current local receive rate in percent, stamped into outgoing frames.
    pub fn recv_rate(&self) -> u8 {
        self.recv_rate.load(Ordering::Relaxed)
    }

    /// Update the local receive rate (0..=100).
    pub fn set_recv_rate(&self, rate: u8) {
        self.recv_rate.store(rate.min(100), Ordering::Relaxed);
    }

    /// Take the next outgoing sequence and the cipher to seal with.
    ///
    /// A regular-handler wrap rolls the out-key and resets the priority
    /// handler to zero, so priority numbering restarts under the new key.
    pub fn next_out(&self, priority: bool) -> Result<OutSeal> {
        let mut state = self.lock();
        if state.keys.is_none() {
            return Err(SessionError::EncryptionNotSetUp);
        }
        let ack = state.regular_in.highest();

        let next = if priority {
            state.priority_out.next()
        } else {
            state.regular_out.next()
        };

        let keys = state.keys.as_mut().ok_or(SessionError::EncryptionNotSetUp)?;
        if next.rollover {
            keys.roll_out();
            tracing::debug!(priority, "outgoing AEAD key rolled over");
        }
        let cipher = keys.out_cipher.clone();
        if next.rollover && !priority {
            state.priority_out.reset();
        }

        Ok(OutSeal {
            params: OutParams {
                seq: next.seq,
                ack,
                recv_rate: self.recv_rate(),
                rollover: next.rollover,
            },
            cipher,
        })
    }

    /// Ciphers for opening an incoming frame with sequence `seq`.
    ///
    /// Replays are rejected here, before any decryption work. When the
    /// sequence hints at a sender rollover, the replay check is deferred and
    /// a candidate cipher under the rolled key is returned alongside.
    pub fn in_ciphers(&self, priority: bool, seq: u32) -> Result<InCiphers> {
        let state = self.lock();
        let keys = state.keys.as_ref().ok_or(SessionError::EncryptionNotSetUp)?;
        let inbound = if priority { &state.priority_in } else { &state.regular_in };

        if inbound.rollover_suspected(seq) {
            let candidate_key = rollover_key(&keys.in_key);
            let candidate = ChaCha20Poly1305::new(Key::from_slice(candidate_key.as_ref()));
            return Ok(InCiphers {
                current: keys.in_cipher.clone(),
                rollover_candidate: Some(candidate),
            });
        }

        inbound.precheck(seq)?;
        Ok(InCiphers {
            current: keys.in_cipher.clone(),
            rollover_candidate: None,
        })
    }

    /// Record a successfully authenticated incoming sequence.
    ///
    /// `rolled` reports that the rollover candidate cipher opened the frame;
    /// the in-key is then committed to the rolled key and the affected
    /// handlers reset before the sequence is registered.
    pub fn register_in(&self, priority: bool, seq: u32, rolled: bool) -> Result<()> {
        let mut state = self.lock();
        if rolled {
            let keys = state.keys.as_mut().ok_or(SessionError::EncryptionNotSetUp)?;
            keys.roll_in();
            tracing::debug!(priority, "incoming AEAD key rolled over");
            if priority {
                state.priority_in.reset();
            } else {
                state.regular_in.reset();
                state.priority_in.reset();
            }
        }
        if priority {
            state.priority_in.register(seq)
        } else {
            state.regular_in.register(seq)
        }
    }

    /// Short identifier of the current out-key, for diagnostics.
    pub fn out_key_id(&self) -> Option<u64> {
        let state = self.lock();
        state.keys.as_ref().map(|k| key_id(&k.out_key))
    }

    /// Short identifier of the current in-key, for diagnostics.
    pub fn in_key_id(&self) -> Option<u64> {
        let state = self.lock();
        state.keys.as_ref().map(|k| key_id(&k.in_key))
    }

    /// Last sequence handed out on a handler.
    pub fn out_sequence(&self, priority: bool) -> u32 {
        let state = self.lock();
        if priority {
            state.priority_out.current()
        } else {
            state.regular_out.current()
        }
    }

    /// Pin an outgoing sequence counter. Test support.
    pub fn set_out_sequence(&self, priority: bool, value: u32) {
        let mut state = self.lock();
        if priority {
            state.priority_out.set(value);
        } else {
            state.regular_out.set(value);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AeadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key_id(key: &[u8; 32]) -> u64 {
    let digest = blake3::hash(key);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(id)
}

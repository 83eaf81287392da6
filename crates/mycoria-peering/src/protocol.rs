//! The peering handshake.
//!
//! Three CBOR messages carried in signed `RouterPing` frames: request,
//! response, ack. Both sides send a request when the link opens (the client
//! first); the role passed in at link construction decides who answers.
//! After the ack, both sides hold a fresh link-layer AEAD session and the
//! X25519 ephemerals are wiped.
//!
//! Signed handshake frames are sent with the TTL at 0, then set to 1 after
//! signing, so the signed payload is TTL-independent.

use std::net::Ipv6Addr;
use std::sync::Arc;

use mycoria_addr::{PrivateIdentity, RouterAddress};
use mycoria_session::aead::AeadSession;
use mycoria_session::kdf::{extra_keys_context, PURPOSE_LINK_LAYER};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{PeeringError, Result};

/// The only supported link protocol version.
pub const LINK_VERSION: u8 = 1;

/// Key-exchange algorithm identifier.
pub const KX_TYPE_X25519: &str = "X25519";

/// Minimum accepted challenge length in bytes.
pub const MIN_CHALLENGE_LEN: usize = 16;

/// A handshake exceeding this many message rounds kills the link.
pub const MAX_ROUNDS: usize = 3;

/// The single handshake message shape; unused fields stay at their
/// defaults. Error paths send the same shape with `err` populated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeeringMsg {
    #[serde(default)]
    pub router_version: String,
    #[serde(default)]
    pub universe: String,
    #[serde(default)]
    pub lite_mode: bool,
    #[serde(default)]
    pub public_address: Option<RouterAddress>,
    #[serde(default)]
    pub challenge: Vec<u8>,
    #[serde(default)]
    pub link_version: u8,
    #[serde(default)]
    pub tun_mtu: u16,
    #[serde(default)]
    pub universe_auth: Vec<u8>,
    #[serde(default)]
    pub kx_key: Vec<u8>,
    #[serde(default)]
    pub kx_type: String,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub err: String,
}

impl PeeringMsg {
    /// An error message terminating the handshake.
    pub fn error(reason: &str) -> Self {
        Self {
            err: reason.to_string(),
            ..Self::default()
        }
    }
}

/// Encode a handshake message to CBOR.
pub fn encode(msg: &PeeringMsg) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(msg, &mut bytes)
        .map_err(|e| PeeringError::HandshakeFailed(format!("message encoding failed: {e}")))?;
    Ok(bytes)
}

/// Decode a handshake message from CBOR.
pub fn decode(bytes: &[u8]) -> Result<PeeringMsg> {
    ciborium::from_reader(bytes)
        .map_err(|e| PeeringError::HandshakeFailed(format!("message decoding failed: {e}")))
}

/// Universe membership proof:
/// `BLAKE3(universe ‖ challenge ‖ secret ‖ requester_ip ‖ responder_ip)`.
pub fn universe_auth(
    universe: &str,
    challenge: &[u8],
    secret: &str,
    requester: Ipv6Addr,
    responder: Ipv6Addr,
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(universe.as_bytes());
    hasher.update(challenge);
    hasher.update(secret.as_bytes());
    hasher.update(&requester.octets());
    hasher.update(&responder.octets());
    *hasher.finalize().as_bytes()
}

/// Static configuration of one handshake attempt.
#[derive(Clone)]
pub struct HandshakeConfig {
    pub local: Arc<PrivateIdentity>,
    pub universe: String,
    pub universe_secret: String,
    pub router_version: String,
    pub lite: bool,
    pub tun_mtu: u16,
    /// This side initiated the connection. Resolves the request/request
    /// interleaving: only the server answers requests.
    pub client: bool,
}

/// What a completed handshake yields.
pub struct HandshakeOutcome {
    pub remote: RouterAddress,
    pub remote_version: String,
    pub remote_lite: bool,
    pub remote_tun_mtu: u16,
    /// The fresh link-layer AEAD session.
    pub link_session: AeadSession,
}

/// The handshake state machine. Transport-agnostic: the caller moves
/// [`PeeringMsg`] values in and out and carries them in signed frames.
pub struct Handshake {
    config: HandshakeConfig,
    challenge: [u8; 32],
    remote: Option<RouterAddress>,
    remote_version: String,
    remote_lite: bool,
    remote_tun_mtu: u16,
    link_session: AeadSession,
    rounds: usize,
    complete: bool,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        let mut challenge = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self {
            config,
            challenge,
            remote: None,
            remote_version: String::new(),
            remote_lite: false,
            remote_tun_mtu: 0,
            link_session: AeadSession::new(),
            rounds: 0,
            complete: false,
        }
    }

    /// The opening request. Both sides send one.
    pub fn request(&self) -> PeeringMsg {
        PeeringMsg {
            router_version: self.config.router_version.clone(),
            universe: self.config.universe.clone(),
            lite_mode: self.config.lite,
            public_address: Some(self.config.local.address().clone()),
            challenge: self.challenge.to_vec(),
            link_version: LINK_VERSION,
            tun_mtu: self.config.tun_mtu,
            ..PeeringMsg::default()
        }
    }

    /// Feed one received message in; returns the message to send back, if
    /// any. Errors terminate the handshake; the caller sends one
    /// best-effort [`PeeringMsg::error`] and closes the link.
    pub fn handle(&mut self, msg: PeeringMsg) -> Result<Option<PeeringMsg>> {
        self.rounds += 1;
        if self.rounds > MAX_ROUNDS {
            return Err(PeeringError::HandshakeFailed(format!(
                "too many handshake rounds ({})",
                self.rounds
            )));
        }

        if !msg.err.is_empty() {
            return Err(PeeringError::RemoteDeniedPeering(msg.err));
        }
        if msg.ack {
            return self.handle_ack(msg).map(|()| None);
        }
        if !msg.kx_key.is_empty() {
            return self.handle_response(msg).map(Some);
        }
        self.handle_request(msg)
    }

    /// Whether both sides hold the link session.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The remote identity, once its request or response arrived.
    pub fn remote(&self) -> Option<&RouterAddress> {
        self.remote.as_ref()
    }

    /// Finish, taking the link session.
    pub fn into_outcome(self) -> Result<HandshakeOutcome> {
        if !self.complete {
            return Err(PeeringError::HandshakeFailed("handshake incomplete".into()));
        }
        let remote = self
            .remote
            .ok_or_else(|| PeeringError::HandshakeFailed("remote identity missing".into()))?;
        Ok(HandshakeOutcome {
            remote,
            remote_version: self.remote_version,
            remote_lite: self.remote_lite,
            remote_tun_mtu: self.remote_tun_mtu,
            link_session: self.link_session,
        })
    }

    fn handle_request(&mut self, msg: PeeringMsg) -> Result<Option<PeeringMsg>> {
        if msg.link_version != LINK_VERSION {
            return Err(PeeringError::HandshakeFailed(format!(
                "unsupported link version {}",
                msg.link_version
            )));
        }
        if msg.challenge.len() < MIN_CHALLENGE_LEN {
            return Err(PeeringError::HandshakeFailed(format!(
                "challenge too short: {} bytes",
                msg.challenge.len()
            )));
        }
        if msg.universe != self.config.universe {
            return Err(PeeringError::UniverseMismatch(format!(
                "remote universe {:?}",
                msg.universe
            )));
        }
        let remote = msg
            .public_address
            .ok_or_else(|| PeeringError::HandshakeFailed("request without public address".into()))?;
        remote
            .verify()
            .map_err(|e| PeeringError::HandshakeFailed(format!("remote address invalid: {e}")))?;
        if remote.ip == self.config.local.ip() {
            return Err(PeeringError::HandshakeFailed(
                "refusing to peer with own address".into(),
            ));
        }

        self.remote_version = msg.router_version;
        self.remote_lite = msg.lite_mode;
        self.remote_tun_mtu = msg.tun_mtu;
        let remote_ip = remote.ip;
        self.remote = Some(remote);

        if self.config.client {
            // The server answers; our own request is already in flight.
            return Ok(None);
        }

        let auth = if self.config.universe_secret.is_empty() {
            Vec::new()
        } else {
            universe_auth(
                &self.config.universe,
                &msg.challenge,
                &self.config.universe_secret,
                remote_ip,
                self.config.local.ip(),
            )
            .to_vec()
        };

        Ok(Some(PeeringMsg {
            challenge: msg.challenge,
            universe_auth: auth,
            kx_key: self.link_session.init_kx().to_vec(),
            kx_type: KX_TYPE_X25519.to_string(),
            ..PeeringMsg::default()
        }))
    }

    fn handle_response(&mut self, msg: PeeringMsg) -> Result<PeeringMsg> {
        if !self.config.client {
            return Err(PeeringError::HandshakeFailed(
                "unexpected response while acting as server".into(),
            ));
        }
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| PeeringError::HandshakeFailed("response before request".into()))?;

        if msg.challenge != self.challenge {
            return Err(PeeringError::HandshakeFailed("challenge mismatch".into()));
        }
        if !self.config.universe_secret.is_empty() {
            let expected = universe_auth(
                &self.config.universe,
                &self.challenge,
                &self.config.universe_secret,
                self.config.local.ip(),
                remote.ip,
            );
            if msg.universe_auth != expected {
                return Err(PeeringError::UniverseMismatch("universe auth failed".into()));
            }
        }
        if msg.kx_type != KX_TYPE_X25519 {
            return Err(PeeringError::HandshakeFailed(format!(
                "unsupported key exchange {:?}",
                msg.kx_type
            )));
        }
        let remote_kx: [u8; 32] = msg
            .kx_key
            .as_slice()
            .try_into()
            .map_err(|_| PeeringError::HandshakeFailed("bad key exchange key length".into()))?;

        let our_kx = self.link_session.init_kx();
        self.link_session
            .complete_kx(&remote_kx, &extra_keys_context(PURPOSE_LINK_LAYER), true)?;
        self.complete = true;

        Ok(PeeringMsg {
            ack: true,
            kx_key: our_kx.to_vec(),
            kx_type: KX_TYPE_X25519.to_string(),
            ..PeeringMsg::default()
        })
    }

    fn handle_ack(&mut self, msg: PeeringMsg) -> Result<()> {
        if self.config.client {
            return Err(PeeringError::HandshakeFailed(
                "unexpected ack while acting as client".into(),
            ));
        }
        if self.remote.is_none() {
            return Err(PeeringError::HandshakeFailed("ack before request".into()));
        }
        if msg.kx_type != KX_TYPE_X25519 {
            return Err(PeeringError::HandshakeFailed(format!(
                "unsupported key exchange {:?}",
                msg.kx_type
            )));
        }
        let remote_kx: [u8; 32] = msg
            .kx_key
            .as_slice()
            .try_into()
            .map_err(|_| PeeringError::HandshakeFailed("bad key exchange key length".into()))?;
        self.link_session
            .complete_kx(&remote_kx, &extra_keys_context(PURPOSE_LINK_LAYER), false)?;
        self.complete = true;
        Ok(())
    }
}

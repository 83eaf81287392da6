//! Frame layout, parsing, and the seal/sign operations.

use std::net::Ipv6Addr;

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Nonce, Tag};
use mycoria_session::aead::AeadSession;
use mycoria_session::signing::SigningSession;
use mycoria_switch::{next_rotate, SwitchLabel};

use crate::varint;
use crate::{FrameError, Result};

/// The only supported frame version.
pub const FRAME_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 44;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Ed25519 signature size carried in the appendix of signed frames.
pub const SIGNATURE_SIZE: usize = 64;

const OFF_VERSION: usize = 0;
const OFF_TTL: usize = 1;
const OFF_FLOW_TYPE: usize = 2;
const OFF_RECV_RATE: usize = 3;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_SRC: usize = 12;
const OFF_DST: usize = 28;
const OFF_SWITCH: usize = HEADER_SIZE;

/// Frame message types, carried in the low nibble of byte 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Hop-by-hop ping; the switch block rotates at every router.
    RouterHopPing = 1,
    /// End-to-end router ping; carries the peering handshake.
    RouterPing = 2,
    /// Router control traffic (announcements, errors).
    RouterCtrl = 3,
    /// Overlay network traffic (TUN packets).
    NetworkTraffic = 4,
    /// Session control between endpoints.
    SessionCtrl = 5,
    /// Application session data.
    SessionData = 6,
}

impl MessageType {
    /// Decode the low nibble of the flow/type byte.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code & 0x0F {
            1 => MessageType::RouterHopPing,
            2 => MessageType::RouterPing,
            3 => MessageType::RouterCtrl,
            4 => MessageType::NetworkTraffic,
            5 => MessageType::SessionCtrl,
            6 => MessageType::SessionData,
            _ => return None,
        })
    }

    /// Whether frames of this type use the priority sequence handler and
    /// queue.
    pub fn is_priority(self) -> bool {
        matches!(
            self,
            MessageType::RouterHopPing | MessageType::RouterPing | MessageType::RouterCtrl
        )
    }
}

/// Flow-control flags, carried in the high nibble of byte 2.
///
/// Hold is the zero state; decrease and increase are distinct bits so a
/// relay can merge indications from several links.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowFlags(u8);

impl FlowFlags {
    /// Keep the current send rate.
    pub const HOLD: FlowFlags = FlowFlags(0b0000);
    /// Ask the peer to slow down.
    pub const DECREASE: FlowFlags = FlowFlags(0b0001);
    /// Invite the peer to speed up.
    pub const INCREASE: FlowFlags = FlowFlags(0b0010);

    /// Build from the high nibble of the flow/type byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    /// The raw nibble.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether all flags in `other` are set.
    pub fn contains(self, other: FlowFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Merge two indications.
    #[must_use]
    pub fn or(self, other: FlowFlags) -> FlowFlags {
        FlowFlags(self.0 | other.0)
    }
}

/// Immutable header parameters for building a frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameOpts {
    pub ttl: u8,
    pub flow: FlowFlags,
    pub message_type: MessageType,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Region {
    start: usize,
    len: usize,
}

impl Region {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// One wire frame over an owned buffer.
///
/// The message and appendix regions are only addressable while the payload
/// is plaintext: immediately after building or signing, or after a
/// successful unseal.
pub struct Frame {
    buf: Vec<u8>,
    switch: Region,
    /// Start of the message length prefix; the sealed span runs from here
    /// to the tag.
    payload_start: usize,
    message: Option<Region>,
    appendix: Option<Region>,
}

impl Frame {
    /// Build a frame into `buf` (cleared first; typically from the pool).
    ///
    /// `reserve_signature` sizes the appendix for a trailing Ed25519
    /// signature to be filled in by [`Frame::sign`].
    pub fn build(
        mut buf: Vec<u8>,
        opts: FrameOpts,
        switch_block: &[u8],
        message: &[u8],
        appendix: &[u8],
        reserve_signature: bool,
    ) -> Self {
        buf.clear();
        buf.resize(HEADER_SIZE, 0);
        buf[OFF_VERSION] = FRAME_VERSION;
        buf[OFF_TTL] = opts.ttl;
        buf[OFF_FLOW_TYPE] = (opts.flow.bits() << 4) | opts.message_type as u8;
        buf[OFF_SRC..OFF_SRC + 16].copy_from_slice(&opts.src.octets());
        buf[OFF_DST..OFF_DST + 16].copy_from_slice(&opts.dst.octets());

        varint::write(&mut buf, switch_block.len() as u64);
        let switch = Region {
            start: buf.len(),
            len: switch_block.len(),
        };
        buf.extend_from_slice(switch_block);

        let payload_start = buf.len();
        varint::write(&mut buf, message.len() as u64);
        let message_region = Region {
            start: buf.len(),
            len: message.len(),
        };
        buf.extend_from_slice(message);

        let appendix_len = appendix.len() + if reserve_signature { SIGNATURE_SIZE } else { 0 };
        varint::write(&mut buf, appendix_len as u64);
        let appendix_region = Region {
            start: buf.len(),
            len: appendix_len,
        };
        buf.extend_from_slice(appendix);
        buf.resize(appendix_region.end(), 0);

        // Tag slot.
        buf.resize(buf.len() + TAG_SIZE, 0);

        Self {
            buf,
            switch,
            payload_start,
            message: Some(message_region),
            appendix: Some(appendix_region),
        }
    }

    /// Parse a received frame. The message and appendix regions stay
    /// unresolved until the payload is known to be plaintext.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < HEADER_SIZE + 1 + TAG_SIZE {
            return Err(FrameError::BufTooSmall {
                need: HEADER_SIZE + 1 + TAG_SIZE,
                have: buf.len(),
            });
        }
        if buf[OFF_VERSION] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(buf[OFF_VERSION]));
        }
        MessageType::from_code(buf[OFF_FLOW_TYPE])
            .ok_or_else(|| FrameError::InvalidFrame("unknown message type".into()))?;

        let (switch_len, prefix) = varint::read(&buf[OFF_SWITCH..])?;
        let switch = Region {
            start: OFF_SWITCH + prefix,
            len: switch_len as usize,
        };
        let payload_start = switch.end();
        if payload_start + TAG_SIZE > buf.len() {
            return Err(FrameError::InvalidFrame("switch block overruns frame".into()));
        }

        Ok(Self {
            buf,
            switch,
            payload_start,
            message: None,
            appendix: None,
        })
    }

    /// Resolve the message and appendix regions of a plaintext payload.
    pub fn parse_payload(&mut self) -> Result<()> {
        if self.message.is_some() {
            return Ok(());
        }
        let payload_end = self.buf.len() - TAG_SIZE;

        let (message_len, prefix) = varint::read(&self.buf[self.payload_start..payload_end])?;
        let message = Region {
            start: self.payload_start + prefix,
            len: message_len as usize,
        };
        if message.end() > payload_end {
            return Err(FrameError::InvalidFrame("message overruns frame".into()));
        }

        let (appendix_len, prefix) = varint::read(&self.buf[message.end()..payload_end])?;
        let appendix = Region {
            start: message.end() + prefix,
            len: appendix_len as usize,
        };
        if appendix.end() != payload_end {
            return Err(FrameError::InvalidFrame("appendix does not end at tag".into()));
        }

        self.message = Some(message);
        self.appendix = Some(appendix);
        Ok(())
    }

    // Header accessors.

    pub fn version(&self) -> u8 {
        self.buf[OFF_VERSION]
    }

    pub fn ttl(&self) -> u8 {
        self.buf[OFF_TTL]
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buf[OFF_TTL] = ttl;
    }

    /// Decrement the TTL for one transit hop, reporting whether it is spent.
    pub fn decrement_ttl(&mut self) -> bool {
        let ttl = self.buf[OFF_TTL].saturating_sub(1);
        self.buf[OFF_TTL] = ttl;
        ttl == 0
    }

    pub fn message_type(&self) -> MessageType {
        // Validated at parse/build time.
        MessageType::from_code(self.buf[OFF_FLOW_TYPE]).unwrap_or(MessageType::RouterCtrl)
    }

    pub fn flow_flags(&self) -> FlowFlags {
        FlowFlags::from_bits(self.buf[OFF_FLOW_TYPE] >> 4)
    }

    pub fn set_flow_flags(&mut self, flow: FlowFlags) {
        self.buf[OFF_FLOW_TYPE] =
            (flow.bits() << 4) | (self.buf[OFF_FLOW_TYPE] & 0x0F);
    }

    pub fn recv_rate(&self) -> u8 {
        self.buf[OFF_RECV_RATE]
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes(
            self.buf[OFF_SEQ..OFF_SEQ + 4]
                .try_into()
                .unwrap_or_default(),
        )
    }

    pub fn ack(&self) -> u32 {
        u32::from_be_bytes(
            self.buf[OFF_ACK..OFF_ACK + 4]
                .try_into()
                .unwrap_or_default(),
        )
    }

    pub fn src(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buf[OFF_SRC..OFF_SRC + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn dst(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buf[OFF_DST..OFF_DST + 16]);
        Ipv6Addr::from(octets)
    }

    // Regions.

    /// The switch block bytes.
    pub fn switch_block(&self) -> &[u8] {
        &self.buf[self.switch.start..self.switch.end()]
    }

    /// Rotate the switch block one hop in place. The rotation never touches
    /// the sealed payload: the seal does not cover the switch region.
    pub fn rotate_switch_block(&mut self, return_label: SwitchLabel) -> Result<SwitchLabel> {
        let region = self.switch.start..self.switch.end();
        next_rotate(&mut self.buf[region], return_label)
            .map_err(|e| FrameError::InvalidFrame(format!("switch rotation failed: {e}")))
    }

    /// The message data of a plaintext payload.
    pub fn message_data(&self) -> Result<&[u8]> {
        let region = self
            .message
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        Ok(&self.buf[region.start..region.end()])
    }

    /// The appendix data of a plaintext payload. For signed frames, use
    /// [`Frame::signed_appendix_data`] to strip the trailing signature.
    pub fn appendix_data(&self) -> Result<&[u8]> {
        let region = self
            .appendix
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        Ok(&self.buf[region.start..region.end()])
    }

    /// The whole frame as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the underlying buffer back, e.g. to recycle it into the pool.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    // Sealing.

    /// Seal the payload with the session's out-cipher.
    ///
    /// Stamps sequence, acknowledgement and receive rate, then encrypts the
    /// message and appendix regions in place. AAD covers the version, the
    /// zeroed TTL, the flow/type byte and both addresses; the nonce is the
    /// first 12 header bytes with the TTL zeroed, made unique by the
    /// stamped sequence.
    pub fn seal(&mut self, session: &AeadSession) -> Result<()> {
        let priority = self.message_type().is_priority();
        let out = session.next_out(priority)?;

        self.buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&out.params.seq.to_be_bytes());
        self.buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&out.params.ack.to_be_bytes());
        self.buf[OFF_RECV_RATE] = out.params.recv_rate;

        let nonce_bytes = self.crypto_nonce();
        let aad = self.crypto_aad();
        let tag_start = self.buf.len() - TAG_SIZE;
        let region = self.payload_start..tag_start;

        let tag = out
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), &aad, &mut self.buf[region])
            .map_err(|_| mycoria_session::SessionError::AeadDecryption)?;
        self.buf[tag_start..].copy_from_slice(&tag);

        self.message = None;
        self.appendix = None;
        Ok(())
    }

    /// Open a sealed payload with the session's in-cipher.
    ///
    /// Replays are rejected before decryption; a suspected sender key
    /// rollover is committed only once the candidate cipher authenticates
    /// the frame. On success the sequence is registered and the payload
    /// regions are resolved.
    pub fn unseal(&mut self, session: &AeadSession) -> Result<()> {
        let priority = self.message_type().is_priority();
        let seq = self.seq();
        let ciphers = session.in_ciphers(priority, seq)?;

        let nonce_bytes = self.crypto_nonce();
        let aad = self.crypto_aad();
        let tag_start = self.buf.len() - TAG_SIZE;
        let tag = Tag::clone_from_slice(&self.buf[tag_start..]);

        let opened = ciphers
            .current
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                &aad,
                &mut self.buf[self.payload_start..tag_start],
                &tag,
            )
            .map(|()| false)
            .or_else(|_| match &ciphers.rollover_candidate {
                Some(candidate) => candidate
                    .decrypt_in_place_detached(
                        Nonce::from_slice(&nonce_bytes),
                        &aad,
                        &mut self.buf[self.payload_start..tag_start],
                        &tag,
                    )
                    .map(|()| true)
                    .map_err(|_| mycoria_session::SessionError::AeadDecryption),
                None => Err(mycoria_session::SessionError::AeadDecryption),
            })?;

        session.register_in(priority, seq, opened)?;
        self.parse_payload()
    }

    // Signing.

    /// Sign the frame end-to-end.
    ///
    /// The frame must have been built with a reserved signature slot. The
    /// TTL is zeroed while signing so the signature is TTL-independent, and
    /// the switch block is excluded because it mutates in transit.
    pub fn sign(&mut self, session: &SigningSession) -> Result<()> {
        let appendix = self
            .appendix
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        if appendix.len < SIGNATURE_SIZE {
            return Err(FrameError::BufTooSmall {
                need: SIGNATURE_SIZE,
                have: appendix.len,
            });
        }
        let seq = session.next_sequence();
        self.buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());

        let sig_start = appendix.end() - SIGNATURE_SIZE;
        let message = self.signed_bytes(sig_start);
        let signature = session.sign(&message);
        self.buf[sig_start..appendix.end()].copy_from_slice(&signature.to_bytes());
        Ok(())
    }

    /// Verify a signed frame and its timestamp sequence.
    pub fn verify(&mut self, session: &SigningSession) -> Result<()> {
        self.parse_payload()?;
        let appendix = self
            .appendix
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        if appendix.len < SIGNATURE_SIZE {
            return Err(FrameError::InvalidFrame("appendix too short for signature".into()));
        }

        let sig_start = appendix.end() - SIGNATURE_SIZE;
        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(&self.buf[sig_start..appendix.end()]);
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

        let message = self.signed_bytes(sig_start);
        session.verify(&message, &signature)?;
        session.check_sequence(self.seq())?;
        Ok(())
    }

    /// Verify a signed frame against a bare address record, without a
    /// session. Used for handshake requests, where the signer's identity
    /// arrives inside the frame itself; no sequence baseline exists yet.
    pub fn verify_with(&mut self, remote: &mycoria_addr::RouterAddress) -> Result<()> {
        self.parse_payload()?;
        let appendix = self
            .appendix
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        if appendix.len < SIGNATURE_SIZE {
            return Err(FrameError::InvalidFrame("appendix too short for signature".into()));
        }

        let sig_start = appendix.end() - SIGNATURE_SIZE;
        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(&self.buf[sig_start..appendix.end()]);
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

        let message = self.signed_bytes(sig_start);
        remote
            .verify_sig(&message, &signature)
            .map_err(|_| mycoria_session::SessionError::SignatureFailure)?;
        Ok(())
    }

    /// The signed appendix payload (without the trailing signature).
    pub fn signed_appendix_data(&self) -> Result<&[u8]> {
        let appendix = self
            .appendix
            .ok_or_else(|| FrameError::InvalidFrame("payload is sealed".into()))?;
        if appendix.len < SIGNATURE_SIZE {
            return Err(FrameError::InvalidFrame("appendix too short for signature".into()));
        }
        Ok(&self.buf[appendix.start..appendix.end() - SIGNATURE_SIZE])
    }

    fn signed_bytes(&self, sig_start: usize) -> Vec<u8> {
        let mut message =
            Vec::with_capacity(HEADER_SIZE + (sig_start - self.payload_start));
        message.extend_from_slice(&self.buf[..HEADER_SIZE]);
        message[OFF_TTL] = 0;
        message.extend_from_slice(&self.buf[self.payload_start..sig_start]);
        message
    }

    fn crypto_nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&self.buf[..12]);
        nonce[OFF_TTL] = 0;
        nonce
    }

    fn crypto_aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(3 + 32);
        aad.push(self.buf[OFF_VERSION]);
        aad.push(0); // TTL, zeroed
        aad.push(self.buf[OFF_FLOW_TYPE]);
        aad.extend_from_slice(&self.buf[OFF_SRC..OFF_DST + 16]);
        aad
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.message_type())
            .field("src", &self.src())
            .field("dst", &self.dst())
            .field("ttl", &self.ttl())
            .field("seq", &self.seq())
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mycoria_addr::PrivateIdentity;
    use mycoria_session::kdf::CONTEXT_INITIAL_SETUP;

    const TEST_DATA: &[u8] = b"The quick brown fox jumps over the lazy dog. ";

    fn opts(message_type: MessageType) -> FrameOpts {
        FrameOpts {
            ttl: 255,
            flow: FlowFlags::HOLD,
            message_type,
            src: "ff02::1".parse().expect("ip"),
            dst: "ff02::2".parse().expect("ip"),
        }
    }

    fn aead_pair() -> (AeadSession, AeadSession) {
        let client = AeadSession::new();
        let server = AeadSession::new();
        let client_pub = client.init_kx();
        let server_pub = server.init_kx();
        client
            .complete_kx(&server_pub, CONTEXT_INITIAL_SETUP, true)
            .expect("kx");
        server
            .complete_kx(&client_pub, CONTEXT_INITIAL_SETUP, false)
            .expect("kx");
        (client, server)
    }

    #[test]
    fn test_reference_header_layout() {
        // Reference vector: type RouterPing, flow Hold, TTL 255,
        // recv_rate 99, seq 123456789, ack 987654321, src ff02::1,
        // dst ff02::2, all three regions carrying the same test data.
        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::RouterPing),
            TEST_DATA,
            TEST_DATA,
            TEST_DATA,
            false,
        );
        frame.buf[OFF_RECV_RATE] = 99;
        frame.buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&123_456_789u32.to_be_bytes());
        frame.buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&987_654_321u32.to_be_bytes());

        let bytes = frame.as_bytes();
        assert_eq!(bytes[0], 0x01, "version");
        assert_eq!(bytes[1], 0xFF, "ttl");
        assert_eq!(bytes[2], 0x02, "hold flow, RouterPing");
        assert_eq!(bytes[3], 0x63, "recv rate 99");
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x07, 0x5B, 0xCD, 0x15]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x3A, 0xDE, 0x68, 0xB1]);
        assert_eq!(
            &bytes[OFF_SRC..OFF_SRC + 4],
            &[0xFF, 0x02, 0x00, 0x00],
            "src starts with ff02"
        );
        assert_eq!(bytes[OFF_SRC + 15], 0x01);
        assert_eq!(bytes[OFF_DST + 15], 0x02);

        // Switch block: 45-byte varint prefix then the data.
        assert_eq!(bytes[OFF_SWITCH], 0x2D);
        assert_eq!(&bytes[OFF_SWITCH + 1..OFF_SWITCH + 5], b"The ");

        // Message region mirrors it.
        let message_prefix = OFF_SWITCH + 1 + TEST_DATA.len();
        assert_eq!(bytes[message_prefix], 0x2D);
        assert_eq!(&bytes[message_prefix + 1..message_prefix + 4], b"The");

        assert_eq!(
            bytes.len(),
            HEADER_SIZE + 3 * (1 + TEST_DATA.len()) + TAG_SIZE
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[5, 9],
            b"hello",
            b"world",
            false,
        );
        let bytes = frame.as_bytes().to_vec();

        let mut parsed = Frame::from_bytes(bytes).expect("parse");
        parsed.parse_payload().expect("payload");
        assert_eq!(parsed.message_type(), MessageType::SessionData);
        assert_eq!(parsed.ttl(), 255);
        assert_eq!(parsed.switch_block(), &[5, 9]);
        assert_eq!(parsed.message_data().expect("message"), b"hello");
        assert_eq!(parsed.appendix_data().expect("appendix"), b"world");
    }

    #[test]
    fn test_rejects_unknown_version() {
        let frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[],
            b"x",
            &[],
            false,
        );
        let mut bytes = frame.into_buffer();
        bytes[0] = 9;
        assert!(matches!(
            Frame::from_bytes(bytes),
            Err(FrameError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let (client, server) = aead_pair();
        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[7],
            TEST_DATA,
            &[],
            false,
        );
        frame.seal(&client).expect("seal");
        assert!(frame.message_data().is_err(), "sealed payload unreadable");

        let mut received = Frame::from_bytes(frame.into_buffer()).expect("parse");
        received.unseal(&server).expect("unseal");
        assert_eq!(received.message_data().expect("message"), TEST_DATA);
        assert_eq!(received.seq(), 1);
    }

    #[test]
    fn test_unseal_survives_transit_ttl_decrement() {
        let (client, server) = aead_pair();
        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[],
            b"via transit",
            &[],
            false,
        );
        frame.seal(&client).expect("seal");

        let mut received = Frame::from_bytes(frame.into_buffer()).expect("parse");
        // Three transit hops decrement the TTL.
        received.set_ttl(252);
        received.unseal(&server).expect("unseal");
        assert_eq!(received.message_data().expect("message"), b"via transit");
    }

    #[test]
    fn test_unseal_rejects_tampered_header() {
        let (client, server) = aead_pair();
        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[],
            b"payload",
            &[],
            false,
        );
        frame.seal(&client).expect("seal");

        let mut bytes = frame.into_buffer();
        // Flip a destination byte: covered by the AAD.
        bytes[OFF_DST + 15] ^= 0xFF;
        let mut received = Frame::from_bytes(bytes).expect("parse");
        assert!(received.unseal(&server).is_err());
    }

    #[test]
    fn test_unseal_rejects_replay() {
        let (client, server) = aead_pair();
        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            &[],
            b"payload",
            &[],
            false,
        );
        frame.seal(&client).expect("seal");
        let bytes = frame.into_buffer();

        let mut first = Frame::from_bytes(bytes.clone()).expect("parse");
        first.unseal(&server).expect("unseal");
        let mut replayed = Frame::from_bytes(bytes).expect("parse");
        assert!(replayed.unseal(&server).is_err());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let local = Arc::new(PrivateIdentity::from_parts(&[1u8; 32], 0));
        let remote = Arc::new(PrivateIdentity::from_parts(&[2u8; 32], 0));
        let signer = SigningSession::new(local.clone(), remote.address().clone());
        let verifier = SigningSession::new(remote, local.address().clone());

        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::RouterPing),
            &[],
            b"peering request",
            b"meta",
            true,
        );
        // The signed payload is TTL-independent: sign at 0, send at 1.
        frame.set_ttl(0);
        frame.sign(&signer).expect("sign");
        frame.set_ttl(1);

        let mut received = Frame::from_bytes(frame.into_buffer()).expect("parse");
        received.verify(&verifier).expect("verify");
        assert_eq!(received.message_data().expect("message"), b"peering request");
        assert_eq!(received.signed_appendix_data().expect("appendix"), b"meta");
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let local = Arc::new(PrivateIdentity::from_parts(&[1u8; 32], 0));
        let remote = Arc::new(PrivateIdentity::from_parts(&[2u8; 32], 0));
        let signer = SigningSession::new(local.clone(), remote.address().clone());
        let verifier = SigningSession::new(remote, local.address().clone());

        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::RouterPing),
            &[],
            b"peering request",
            &[],
            true,
        );
        frame.sign(&signer).expect("sign");

        let mut bytes = frame.into_buffer();
        let message_start = HEADER_SIZE + 1 + 1; // empty switch block, prefix
        bytes[message_start] ^= 0xFF;
        let mut received = Frame::from_bytes(bytes).expect("parse");
        assert!(received.verify(&verifier).is_err());
    }

    #[test]
    fn test_rotation_through_sealed_frame() {
        let (client, server) = aead_pair();
        let path = mycoria_switch::SwitchPath::new(vec![
            mycoria_switch::Hop {
                router: "fd66::1".parse().expect("ip"),
                delay_ms: 5,
                forward_label: SwitchLabel::new(9).expect("label"),
                return_label: SwitchLabel::TERMINAL,
            },
            mycoria_switch::Hop {
                router: "fd66::2".parse().expect("ip"),
                delay_ms: 5,
                forward_label: SwitchLabel::TERMINAL,
                return_label: SwitchLabel::new(4).expect("label"),
            },
        ])
        .expect("path");

        let mut frame = Frame::build(
            Vec::new(),
            opts(MessageType::SessionData),
            path.forward_block(),
            b"routed payload",
            &[],
            false,
        );
        frame.seal(&client).expect("seal");

        let mut received = Frame::from_bytes(frame.into_buffer()).expect("parse");
        // The sender pops its own label before dispatch.
        let next = received
            .rotate_switch_block(SwitchLabel::TERMINAL)
            .expect("rotate");
        assert_eq!(next, SwitchLabel::new(9).expect("label"));
        // The seal still opens: the switch block is outside it.
        received.unseal(&server).expect("unseal");
        assert_eq!(received.message_data().expect("message"), b"routed payload");
    }
}

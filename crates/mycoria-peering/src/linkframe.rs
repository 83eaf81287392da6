//! Sealed link frames.
//!
//! Each record on the byte stream is a link frame carrying one sealed
//! application frame:
//!
//! ```text
//! 0..2   : length (u16 BE, = whole record)
//! 2      : version = 1
//! 3      : recv_rate (u8)
//! 4..8   : sequence_num (u32 BE)
//! 8..12  : sequence_ack (u32 BE)
//! 12..N-16 : sealed frame
//! N-16..N  : Poly1305 tag
//! ```
//!
//! Nonce = bytes 0..12, no AAD. A single TCP stream delivers records in
//! order, so link sealing always runs on the session's regular handler;
//! the priority/regular split lives in the send queues and the inner
//! frames' own end-to-end sessions.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Nonce, Tag};
use mycoria_session::aead::AeadSession;

use crate::{PeeringError, Result};

/// Link frame header size.
pub const LINK_HEADER_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// The only supported link frame version.
pub const LINK_FRAME_VERSION: u8 = 1;

/// Largest record a link accepts.
pub const MAX_RECORD_SIZE: usize = u16::MAX as usize;

/// Seal an application frame into a link-frame record.
pub fn seal(session: &AeadSession, frame: &[u8]) -> Result<Vec<u8>> {
    let total = LINK_HEADER_SIZE + frame.len() + TAG_SIZE;
    let length = u16::try_from(total).map_err(|_| {
        PeeringError::NetworkWriteError(format!("frame of {} bytes exceeds a link record", frame.len()))
    })?;

    let out = session.next_out(false)?;

    let mut record = Vec::with_capacity(total);
    record.extend_from_slice(&length.to_be_bytes());
    record.push(LINK_FRAME_VERSION);
    record.push(out.params.recv_rate);
    record.extend_from_slice(&out.params.seq.to_be_bytes());
    record.extend_from_slice(&out.params.ack.to_be_bytes());
    record.extend_from_slice(frame);

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&record[..LINK_HEADER_SIZE]);
    let tag = out
        .cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut record[LINK_HEADER_SIZE..])
        .map_err(|_| mycoria_session::SessionError::AeadDecryption)?;
    record.extend_from_slice(&tag);
    Ok(record)
}

/// Unseal a link-frame record in place, returning the inner frame bytes.
pub fn unseal(session: &AeadSession, record: &mut Vec<u8>) -> Result<Vec<u8>> {
    if record.len() < LINK_HEADER_SIZE + TAG_SIZE {
        return Err(PeeringError::HandshakeFailed(format!(
            "link record too short: {} bytes",
            record.len()
        )));
    }
    let length = u16::from_be_bytes([record[0], record[1]]) as usize;
    if length != record.len() {
        return Err(PeeringError::NetworkReadError(format!(
            "link record length {length} does not match {} received bytes",
            record.len()
        )));
    }
    if record[2] != LINK_FRAME_VERSION {
        return Err(PeeringError::HandshakeFailed(format!(
            "unsupported link frame version {}",
            record[2]
        )));
    }

    let seq = u32::from_be_bytes([record[4], record[5], record[6], record[7]]);
    let ciphers = session.in_ciphers(false, seq)?;

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&record[..LINK_HEADER_SIZE]);
    let tag_start = record.len() - TAG_SIZE;
    let tag = Tag::clone_from_slice(&record[tag_start..]);

    let rolled = ciphers
        .current
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &[],
            &mut record[LINK_HEADER_SIZE..tag_start],
            &tag,
        )
        .map(|()| false)
        .or_else(|_| match &ciphers.rollover_candidate {
            Some(candidate) => candidate
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    &[],
                    &mut record[LINK_HEADER_SIZE..tag_start],
                    &tag,
                )
                .map(|()| true)
                .map_err(|_| mycoria_session::SessionError::AeadDecryption),
            None => Err(mycoria_session::SessionError::AeadDecryption),
        })?;
    session.register_in(false, seq, rolled)?;

    Ok(record[LINK_HEADER_SIZE..tag_start].to_vec())
}

/// The recv-rate byte a received link frame advertised.
pub fn peer_recv_rate(record: &[u8]) -> Option<u8> {
    record.get(3).copied()
}

//! Switch labels and their varint encoding.
//!
//! The on-wire form is an unsigned varint with the usual continuation-bit
//! scheme, restricted to 14 bits. Encodings must be minimal: a two-byte
//! encoding of a value below 128 is rejected.

use std::net::Ipv6Addr;

use mycoria_addr::classify::{classify, AddressType};
use rand::Rng;

use crate::{Result, SwitchError};

/// Highest encodable label value (14 bits).
pub const MAX_LABEL: u16 = 16383;

/// Highest single-byte ("routable") label value.
pub const MAX_ROUTABLE_LABEL: u16 = 127;

/// A 14-bit switch label. Zero terminates a label stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwitchLabel(u16);

impl SwitchLabel {
    /// The stack terminator.
    pub const TERMINAL: SwitchLabel = SwitchLabel(0);

    /// Create a label, rejecting values above 14 bits.
    pub fn new(value: u16) -> Result<Self> {
        if value > MAX_LABEL {
            return Err(SwitchError::ValueTooBig(u64::from(value)));
        }
        Ok(Self(value))
    }

    /// The numeric label value.
    pub fn value(self) -> u16 {
        self.0
    }

    /// Whether this is the stack terminator.
    pub fn is_terminal(self) -> bool {
        self.0 == 0
    }

    /// Whether this label encodes to a single byte (1..=127).
    pub fn is_routable(self) -> bool {
        self.0 >= 1 && self.0 <= MAX_ROUTABLE_LABEL
    }

    /// Whether this label encodes to two bytes (128..=16383).
    pub fn is_private(self) -> bool {
        self.0 > MAX_ROUTABLE_LABEL
    }

    /// Encoded size in bytes: 1 for values below 128 (including the
    /// terminator), 2 otherwise.
    pub fn encoded_size(self) -> usize {
        if self.0 < 128 {
            1
        } else {
            2
        }
    }

    /// Write the varint encoding into the front of `buf`, returning the
    /// number of bytes written.
    pub fn encode_to(self, buf: &mut [u8]) -> Result<usize> {
        let size = self.encoded_size();
        if buf.len() < size {
            return Err(SwitchError::BufTooSmall {
                need: size,
                have: buf.len(),
            });
        }
        if size == 1 {
            buf[0] = self.0 as u8;
        } else {
            buf[0] = (self.0 & 0x7F) as u8 | 0x80;
            buf[1] = (self.0 >> 7) as u8;
        }
        Ok(size)
    }

    /// Decode a varint label from the front of `buf`, returning the label
    /// and the number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize)> {
        let first = *buf.first().ok_or(SwitchError::BufTooSmall { need: 1, have: 0 })?;
        if first & 0x80 == 0 {
            return Ok((Self(u16::from(first)), 1));
        }
        let second = *buf.get(1).ok_or(SwitchError::BufTooSmall { need: 2, have: 1 })?;
        if second & 0x80 != 0 {
            return Err(SwitchError::InvalidPath("label varint exceeds 14 bits".into()));
        }
        if second == 0 {
            return Err(SwitchError::InvalidPath("non-minimal label encoding".into()));
        }
        let value = u16::from(first & 0x7F) | (u16::from(second) << 7);
        Ok((Self(value), 2))
    }
}

impl std::fmt::Display for SwitchLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<u16> for SwitchLabel {
    type Error = SwitchError;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

/// Derive the preferred switch label for a peer from its address.
///
/// Routing addresses take their last byte modulo 128; privacy addresses take
/// their last two bytes modulo 16384, rejected when the result would collide
/// with the routable range. Returns `None` when derivation fails and a random
/// label should be assigned instead.
pub fn derive_label(ip: Ipv6Addr) -> Option<SwitchLabel> {
    let octets = ip.octets();
    match classify(ip) {
        AddressType::Privacy => {
            let value = u16::from_be_bytes([octets[14], octets[15]]) % (MAX_LABEL + 1);
            if value <= MAX_ROUTABLE_LABEL {
                None
            } else {
                Some(SwitchLabel(value))
            }
        }
        AddressType::Invalid | AddressType::Internal | AddressType::Reserved => None,
        _ => {
            let value = u16::from(octets[15]) % (u16::from(MAX_ROUTABLE_LABEL) + 1);
            if value == 0 {
                None
            } else {
                Some(SwitchLabel(value))
            }
        }
    }
}

/// Pick a random unused label.
///
/// Tries up to 100 single-byte labels first (only when the peer may use the
/// routable range), then up to 1000 two-byte labels. `in_use` reports whether
/// a candidate is already assigned.
pub fn random_label(routable: bool, mut in_use: impl FnMut(SwitchLabel) -> bool) -> Option<SwitchLabel> {
    let mut rng = rand::thread_rng();
    if routable {
        for _ in 0..100 {
            let candidate = SwitchLabel(rng.gen_range(1..=MAX_ROUTABLE_LABEL));
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
    }
    for _ in 0..1000 {
        let candidate = SwitchLabel(rng.gen_range(MAX_ROUTABLE_LABEL + 1..=MAX_LABEL));
        if !in_use(candidate) {
            return Some(candidate);
        }
    }
    None
}

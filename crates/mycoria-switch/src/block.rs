//! Switch-block rotation.
//!
//! A switch block is a fixed-length byte array holding the varint labels of
//! the remaining hops, right-padded with zeros. Every router along the path
//! pops the leading label to pick its outbound link and writes its own
//! return label behind the stack, byte-reversed. Reversing the whole array
//! at the destination therefore yields a ready-to-send return block.
//!
//! Rotation always operates on a caller-owned copy; stored path blocks are
//! immutable.

use crate::label::SwitchLabel;
use crate::{Result, SwitchError};

/// Rotate a switch block one hop.
///
/// Pops and returns the leading label (the terminator when this router is
/// the destination), shifts the remainder to the front, and records
/// `return_label` in the first free slot behind the stack — found as the
/// second zero byte from the front, counting the popped label when it was
/// itself zero, and defaulting to the last byte.
pub fn next_rotate(block: &mut [u8], return_label: SwitchLabel) -> Result<SwitchLabel> {
    let (next, consumed) = SwitchLabel::decode_from(block)?;

    // Shift the remaining bytes to offset 0 and zero the vacated tail.
    block.copy_within(consumed.., 0);
    let len = block.len();
    block[len - consumed..].fill(0);

    // Find the write position: the second zero byte from the front. The
    // popped label counts as the first zero when the stack just ran out.
    let mut zeros_seen = usize::from(next.is_terminal());
    let mut position = len - 1;
    for (index, byte) in block.iter().enumerate() {
        if *byte == 0 {
            zeros_seen += 1;
            if zeros_seen == 2 {
                position = index;
                break;
            }
        }
    }

    let size = return_label.encoded_size();
    if position + size > len {
        return Err(SwitchError::BufTooSmall {
            need: position + size,
            have: len,
        });
    }
    return_label.encode_to(&mut block[position..])?;
    block[position..position + size].reverse();

    Ok(next)
}

/// Transform a fully rotated block into the return block in place:
/// reverse the whole array, then shift past the leading zeros.
pub fn to_return_block(block: &mut [u8]) {
    block.reverse();
    let start = block.iter().position(|b| *b != 0).unwrap_or(block.len());
    block.copy_within(start.., 0);
    let len = block.len();
    block[len - start..].fill(0);
}

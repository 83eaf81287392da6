//! Switch paths: ordered hop lists with precomputed label blocks.
//!
//! The forward and return blocks are built once at construction and treated
//! as immutable for the lifetime of the path; rotation always works on a
//! copy. Both blocks share one length: the maximum number of bytes any
//! rotation state can occupy, so no rotation ever needs to reallocate.

use std::net::Ipv6Addr;

use crate::label::SwitchLabel;
use crate::{Result, SwitchError};

/// Maximum number of hop transitions in a path.
pub const MAX_TOTAL_HOPS: usize = 255;

/// One hop of a switch path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hop {
    /// The router at this hop.
    pub router: Ipv6Addr,
    /// Measured one-way delay toward this hop, in milliseconds.
    pub delay_ms: u16,
    /// Label toward the destination; terminal on the last hop.
    pub forward_label: SwitchLabel,
    /// Label back toward the source; terminal on the first hop.
    pub return_label: SwitchLabel,
}

/// A source-selected path from the first hop (the local router) to the last
/// (the destination), with ready-made switch blocks for both directions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchPath {
    hops: Vec<Hop>,
    forward_block: Vec<u8>,
    return_block: Vec<u8>,
    total_hops: u8,
    total_delay: u16,
}

impl SwitchPath {
    /// Build a path from its hops, validating the label invariants and
    /// computing both blocks at their exact minimum size.
    pub fn new(hops: Vec<Hop>) -> Result<Self> {
        let n = hops.len();
        if n < 2 {
            return Err(SwitchError::InvalidPath(format!(
                "a path needs at least 2 hops, got {n}"
            )));
        }
        if n - 1 > MAX_TOTAL_HOPS {
            return Err(SwitchError::InvalidPath(format!(
                "too many hops: {n} routers exceed {MAX_TOTAL_HOPS} transitions"
            )));
        }
        if !hops[0].return_label.is_terminal() {
            return Err(SwitchError::InvalidPath(
                "first hop must have a terminal return label".into(),
            ));
        }
        if !hops[n - 1].forward_label.is_terminal() {
            return Err(SwitchError::InvalidPath(
                "last hop must have a terminal forward label".into(),
            ));
        }
        for hop in &hops[..n - 1] {
            if hop.forward_label.is_terminal() {
                return Err(SwitchError::InvalidPath(
                    "intermediate forward label must not be terminal".into(),
                ));
            }
        }
        for hop in &hops[1..] {
            if hop.return_label.is_terminal() {
                return Err(SwitchError::InvalidPath(
                    "intermediate return label must not be terminal".into(),
                ));
            }
        }

        let size = block_size(&hops);

        let mut forward_block = vec![0u8; size];
        let mut offset = 0;
        for hop in &hops[..n - 1] {
            offset += hop.forward_label.encode_to(&mut forward_block[offset..])?;
        }

        let mut return_block = vec![0u8; size];
        offset = 0;
        for hop in hops[1..].iter().rev() {
            offset += hop.return_label.encode_to(&mut return_block[offset..])?;
        }

        let total_delay = hops
            .iter()
            .fold(0u16, |sum, hop| sum.saturating_add(hop.delay_ms));

        Ok(Self {
            forward_block,
            return_block,
            total_hops: (n - 1) as u8,
            total_delay,
            hops,
        })
    }

    /// The hops of this path, first to last.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// The destination router.
    pub fn destination(&self) -> Ipv6Addr {
        // Validated non-empty at construction.
        self.hops[self.hops.len() - 1].router
    }

    /// The precomputed forward block. Callers rotate a copy, never this.
    pub fn forward_block(&self) -> &[u8] {
        &self.forward_block
    }

    /// The precomputed return block.
    pub fn return_block(&self) -> &[u8] {
        &self.return_block
    }

    /// The shared block length.
    pub fn block_size(&self) -> usize {
        self.forward_block.len()
    }

    /// Number of hop transitions.
    pub fn total_hops(&self) -> u8 {
        self.total_hops
    }

    /// Summed one-way delay in milliseconds.
    pub fn total_delay(&self) -> u16 {
        self.total_delay
    }

    /// Whether `router` appears anywhere along the path.
    pub fn contains_router(&self, router: Ipv6Addr) -> bool {
        self.hops.iter().any(|hop| hop.router == router)
    }
}

/// Compute the exact block size for a hop list.
///
/// Every rotation state holds a contiguous run of the size sequence
/// `[enc(f_0) .. enc(f_{n-2}), 1, enc(r_1) .. enc(r_{n-1})]` — the single
/// `1` being the shared zero terminator, which the forward stack and the
/// first hop's return label occupy exactly once between them. The block must
/// fit the largest of the n+1 runs of length n−1.
fn block_size(hops: &[Hop]) -> usize {
    let n = hops.len();
    let mut sizes = Vec::with_capacity(2 * n - 1);
    for hop in &hops[..n - 1] {
        sizes.push(hop.forward_label.encoded_size());
    }
    sizes.push(1);
    for hop in &hops[1..] {
        sizes.push(hop.return_label.encoded_size());
    }

    let window = n - 1;
    (0..=n)
        .map(|i| sizes[i..i + window].iter().sum::<usize>())
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    use crate::block::{next_rotate, to_return_block};

    fn hop(router_tail: u16, forward: u16, ret: u16) -> Hop {
        Hop {
            router: Ipv6Addr::new(0xfd66, 0, 0, 0, 0, 0, 0, router_tail),
            delay_ms: 10,
            forward_label: SwitchLabel::new(forward).expect("label"),
            return_label: SwitchLabel::new(ret).expect("label"),
        }
    }

    fn random_path(rng: &mut impl Rng, n: usize) -> SwitchPath {
        let hops: Vec<Hop> = (0..n)
            .map(|i| {
                let forward = if i == n - 1 { 0 } else { rng.gen_range(1..=16383) };
                let ret = if i == 0 { 0 } else { rng.gen_range(1..=16383) };
                Hop {
                    router: Ipv6Addr::new(0xfd66, 0, 0, 0, 0, 0, 0, i as u16),
                    delay_ms: rng.gen_range(1..=200),
                    forward_label: SwitchLabel::new(forward).expect("label"),
                    return_label: SwitchLabel::new(ret).expect("label"),
                }
            })
            .collect();
        SwitchPath::new(hops).expect("path")
    }

    #[test]
    fn test_invariant_validation() {
        // Too short.
        assert!(SwitchPath::new(vec![hop(0, 0, 0)]).is_err());
        // First hop return label must be terminal.
        assert!(SwitchPath::new(vec![hop(0, 1, 9), hop(1, 0, 2)]).is_err());
        // Last hop forward label must be terminal.
        assert!(SwitchPath::new(vec![hop(0, 1, 0), hop(1, 5, 2)]).is_err());
        // Intermediate labels must not be terminal.
        assert!(SwitchPath::new(vec![hop(0, 1, 0), hop(1, 0, 2), hop(2, 0, 0)]).is_err());
        // A valid three-hop path.
        assert!(SwitchPath::new(vec![hop(0, 1, 0), hop(1, 2, 3), hop(2, 0, 4)]).is_ok());
    }

    #[test]
    fn test_totals() {
        let path = SwitchPath::new(vec![hop(0, 1, 0), hop(1, 2, 3), hop(2, 0, 4)]).expect("path");
        assert_eq!(path.total_hops(), 2);
        assert_eq!(path.total_delay(), 30);
        assert_eq!(path.destination(), Ipv6Addr::new(0xfd66, 0, 0, 0, 0, 0, 0, 2));
    }

    #[test]
    fn test_forward_and_return_blocks() {
        // All labels encode to one byte; the shared zero terminator makes
        // two bytes enough for every rotation state.
        let path = SwitchPath::new(vec![hop(0, 5, 0), hop(1, 9, 3), hop(2, 0, 7)]).expect("path");
        assert_eq!(path.block_size(), 2);
        assert_eq!(path.forward_block(), &[5, 9]);
        assert_eq!(path.return_block(), &[7, 3]);

        // Mixed one/two-byte labels widen the block to the worst window.
        let path =
            SwitchPath::new(vec![hop(0, 300, 0), hop(1, 400, 500), hop(2, 0, 600)]).expect("path");
        assert_eq!(path.block_size(), 4);
        assert_eq!(path.forward_block(), &[0xAC, 0x02, 0x90, 0x03]);
        assert_eq!(path.return_block(), &[0xD8, 0x04, 0xF4, 0x03]);
    }

    #[test]
    fn test_rotation_preserves_return_path() {
        let mut rng = rand::thread_rng();
        for _ in 0..250 {
            let n = rng.gen_range(3..=10);
            let path = random_path(&mut rng, n);

            // Forward traversal: every router pops its forward label and
            // records its return label.
            let mut block = path.forward_block().to_vec();
            for (k, hop) in path.hops().iter().enumerate() {
                let popped = next_rotate(&mut block, hop.return_label).expect("rotate");
                assert_eq!(popped, hop.forward_label, "hop {k} of {n}");
            }
            to_return_block(&mut block);
            assert_eq!(block, path.return_block(), "return block mismatch for {n} hops");

            // Backward traversal over the return block reproduces the
            // forward block.
            let mut block = path.return_block().to_vec();
            for (k, hop) in path.hops().iter().enumerate().rev() {
                let popped = next_rotate(&mut block, hop.forward_label).expect("rotate");
                assert_eq!(popped, hop.return_label, "return hop {k} of {n}");
            }
            to_return_block(&mut block);
            assert_eq!(block, path.forward_block(), "forward block mismatch for {n} hops");
        }
    }

    #[test]
    fn test_block_size_is_exact_minimum() {
        let mut rng = rand::thread_rng();
        for _ in 0..250 {
            let n = rng.gen_range(3..=10);
            let path = random_path(&mut rng, n);
            let size = path.block_size();

            // The last byte must be populated in at least one rotation state
            // across the full forward+return traversal, otherwise a smaller
            // block would have sufficed.
            let mut last_byte_used = false;

            let mut block = path.forward_block().to_vec();
            last_byte_used |= block[size - 1] != 0;
            for hop in path.hops() {
                next_rotate(&mut block, hop.return_label).expect("rotate");
                last_byte_used |= block[size - 1] != 0;
            }
            to_return_block(&mut block);

            last_byte_used |= block[size - 1] != 0;
            for hop in path.hops().iter().rev() {
                next_rotate(&mut block, hop.forward_label).expect("rotate");
                last_byte_used |= block[size - 1] != 0;
            }

            assert!(last_byte_used, "block size {size} is not tight for {n} hops");
        }
    }

    #[test]
    fn test_delay_saturates() {
        let hops = vec![
            Hop {
                delay_ms: u16::MAX,
                ..hop(0, 1, 0)
            },
            Hop {
                delay_ms: u16::MAX,
                ..hop(1, 0, 2)
            },
        ];
        let path = SwitchPath::new(hops).expect("path");
        assert_eq!(path.total_delay(), u16::MAX);
    }
}

//! Shared helpers for the cross-crate test scenarios.

use std::sync::Arc;

use mycoria_addr::classify::{continent_region, Continent};
use mycoria_addr::PrivateIdentity;

/// A deterministic test identity: scans seeds from the given base until the
/// key derives into a geo-marked Oceania address. Keeping every test
/// identity on one continent means any of them can hold peer routes for the
/// others, and determinism makes failures reproduce.
pub fn test_identity(base_seed: u8) -> Arc<PrivateIdentity> {
    let mut seed = [base_seed; 32];
    let mut counter = 0u32;
    loop {
        let identity = PrivateIdentity::from_parts(&seed, 0);
        if let Some((continent, _)) = continent_region(identity.ip()) {
            if continent == Continent::Oceania {
                return Arc::new(identity);
            }
        }
        counter += 1;
        seed[0] = (counter & 0xFF) as u8;
        seed[1] = ((counter >> 8) & 0xFF) as u8;
        seed[2] = ((counter >> 16) & 0xFF) as u8;
    }
}

/// The canonical test payload.
pub const TEST_PAYLOAD: &[u8] = b"The quick brown fox jumps over the lazy dog. ";

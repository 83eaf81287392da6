//! Address generation.
//!
//! Landing a key in a target prefix is a brute-force search over digest
//! inputs. Two scan modes exist: with `max_easing > 0` a single key pair is
//! kept and the easing nonce is incremented (the key can later be re-aimed
//! without regeneration); with `max_easing == 0` every try uses a fresh key
//! pair. Narrow targets are parallelized across worker threads that observe
//! a shared done flag and race into a bounded result channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use rand::rngs::OsRng;

use crate::address::{derive_address, HashAlg, KeyType, PrivateIdentity};
use crate::prefix::{INTERNAL_PREFIX, Prefix};
use crate::{AddrError, Result};

/// Work threshold below which parallel generation is not worth the setup.
pub const PARALLEL_THRESHOLD: u64 = 10_000;

/// Default total scan budget.
pub const DEFAULT_MAX_TRIES: u64 = 100_000_000;

/// How often workers poll the shared done flag.
const DONE_CHECK_INTERVAL: u64 = 512;

/// Parameters of an address scan.
#[derive(Clone, Debug)]
pub struct GenerateConfig {
    /// The address must fall inside one of these prefixes.
    pub acceptable: Vec<Prefix>,
    /// The address must not fall inside any of these prefixes.
    pub ignore: Vec<Prefix>,
    /// Highest easing nonce to scan; 0 selects fresh-key mode.
    pub max_easing: u64,
    /// Total scan budget across all workers.
    pub max_tries: u64,
    /// Worker threads; values below 2 keep the scan single-threaded.
    pub workers: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            acceptable: vec![crate::prefix::MYCORIA_PREFIX],
            ignore: Vec::new(),
            max_easing: 0,
            max_tries: DEFAULT_MAX_TRIES,
            workers: 1,
        }
    }
}

impl GenerateConfig {
    fn accepts(&self, ip: std::net::Ipv6Addr) -> bool {
        ip.octets()[0] == 0xFD
            && !INTERNAL_PREFIX.contains(ip)
            && self.acceptable.iter().any(|p| p.contains(ip))
            && !self.ignore.iter().any(|p| p.contains(ip))
    }
}

/// Expected number of tries for the widest acceptable prefix.
///
/// The digest is uniform over all 128 bits, so a `/b` prefix is hit with
/// probability `2^-b`.
pub fn expected_tries(acceptable: &[Prefix]) -> u64 {
    let min_bits = acceptable.iter().map(Prefix::bits).min().unwrap_or(128);
    1u64.checked_shl(u32::from(min_bits)).unwrap_or(u64::MAX)
}

/// Generate a router identity whose address satisfies `config`.
///
/// Dispatches to the worker pool when enough workers are configured and the
/// expected work clears [`PARALLEL_THRESHOLD`].
pub fn generate(config: &GenerateConfig) -> Result<PrivateIdentity> {
    if config.workers >= 2 && expected_tries(&config.acceptable) >= PARALLEL_THRESHOLD {
        generate_parallel(config)
    } else {
        let done = AtomicBool::new(false);
        scan(config, 0, config.max_easing, config.max_tries, &done)
    }
}

fn generate_parallel(config: &GenerateConfig) -> Result<PrivateIdentity> {
    let done = AtomicBool::new(false);
    let (tx, rx) = mpsc::sync_channel::<Result<PrivateIdentity>>(1);
    let per_worker_tries = (config.max_tries / config.workers as u64).max(1);

    std::thread::scope(|scope| {
        for worker in 0..config.workers {
            let tx = tx.clone();
            let done = &done;
            // In easing mode each worker owns a contiguous nonce chunk;
            // in fresh-key mode the chunk bounds are ignored.
            let (easing_from, easing_to) = if config.max_easing > 0 {
                let chunk = (config.max_easing / config.workers as u64).max(1);
                let from = chunk * worker as u64;
                let to = if worker == config.workers - 1 {
                    config.max_easing
                } else {
                    (from + chunk).min(config.max_easing)
                };
                (from, to)
            } else {
                (0, 0)
            };
            scope.spawn(move || {
                match scan(config, easing_from, easing_to, per_worker_tries, done) {
                    Ok(identity) => {
                        done.store(true, Ordering::Relaxed);
                        // A sibling may have won the race; dropping the
                        // second result is fine.
                        let _ = tx.try_send(Ok(identity));
                    }
                    Err(AddrError::MaxTriesReached) => {}
                    Err(err) => {
                        let _ = tx.try_send(Err(err));
                    }
                }
            });
        }
        drop(tx);

        match rx.recv() {
            Ok(result) => {
                done.store(true, Ordering::Relaxed);
                result
            }
            // Every worker exhausted its budget without a hit.
            Err(_) => Err(AddrError::MaxTriesReached),
        }
    })
}

/// Scan for an acceptable address, checking the done flag periodically.
fn scan(
    config: &GenerateConfig,
    easing_from: u64,
    easing_to: u64,
    max_tries: u64,
    done: &AtomicBool,
) -> Result<PrivateIdentity> {
    let mut tries = 0u64;

    if easing_to > 0 {
        // Easing mode: one key pair, incrementing nonce.
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key();
        for easing in easing_from..=easing_to {
            if tries >= max_tries {
                return Err(AddrError::MaxTriesReached);
            }
            if tries % DONE_CHECK_INTERVAL == 0 && done.load(Ordering::Relaxed) {
                return Err(AddrError::MaxTriesReached);
            }
            tries += 1;
            let ip = derive_address(public_key.as_bytes(), KeyType::Ed25519, HashAlg::Blake3, easing);
            if config.accepts(ip) {
                return Ok(PrivateIdentity::from_generated(signing_key, easing, ip));
            }
        }
        return Err(AddrError::MaxTriesReached);
    }

    // Fresh-key mode: a new key pair per try, no easing.
    loop {
        if tries >= max_tries {
            return Err(AddrError::MaxTriesReached);
        }
        if tries % DONE_CHECK_INTERVAL == 0 && done.load(Ordering::Relaxed) {
            return Err(AddrError::MaxTriesReached);
        }
        tries += 1;
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let ip = derive_address(
            signing_key.verifying_key().as_bytes(),
            KeyType::Ed25519,
            HashAlg::Blake3,
            0,
        );
        if config.accepts(ip) {
            return Ok(PrivateIdentity::from_generated(signing_key, 0, ip));
        }
    }
}

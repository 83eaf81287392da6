//! Sequence handling: monotonic millisecond timestamps for signed frames
//! and integer counters with a replay bitmap for sealed frames.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Result, SessionError};

/// Replay window width in sequence numbers.
pub const REPLAY_WINDOW: u32 = 64;

/// The outgoing sequence crosses this threshold shortly before wrapping;
/// receivers treat a small incoming sequence past it as a key rollover.
pub const ROLLOVER_THRESHOLD: u32 = 0xFFFF_FF00;

/// Highest sequence value considered "small" for rollover detection.
pub const ROLLOVER_GRACE: u32 = 255;

/// Signed frames older than this are rejected outright.
pub const MAX_FRAME_AGE_MS: u32 = 60_000;

/// Tolerated sender clock skew into the future.
pub const MAX_CLOCK_SKEW_MS: u32 = 60_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Millisecond-precision sequence for signed frames.
///
/// Outgoing values are unique and monotonic even when produced within the
/// same millisecond. Frames carry the low 32 bits; the incoming check uses
/// wrapping order, which is unambiguous for session lifetimes far below the
/// 49-day wrap period.
#[derive(Debug, Default)]
pub struct TimeSequence {
    last_out: Mutex<u64>,
    /// `None` until the first frame primes the baseline.
    highest_in: Mutex<Option<u32>>,
}

impl TimeSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next outgoing timestamp: `max(now, last + 1)` milliseconds.
    pub fn next(&self) -> u64 {
        let mut last = self.last_out.lock().unwrap_or_else(|e| e.into_inner());
        let next = now_ms().max(*last + 1);
        *last = next;
        next
    }

    /// Next outgoing timestamp truncated to the wire width.
    pub fn next_u32(&self) -> u32 {
        self.next() as u32
    }

    /// Check an incoming timestamp: it must lie within the freshness window
    /// around the local clock and strictly after the highest seen so far.
    /// The first accepted timestamp primes the baseline.
    pub fn check(&self, t: u32) -> Result<()> {
        let now = now_ms() as u32;
        let behind_now = now.wrapping_sub(t);
        if behind_now < 0x8000_0000 && behind_now > MAX_FRAME_AGE_MS {
            return Err(SessionError::TooOldFrame);
        }
        let ahead_now = t.wrapping_sub(now);
        if ahead_now < 0x8000_0000 && ahead_now > MAX_CLOCK_SKEW_MS {
            return Err(SessionError::TooNewFrame);
        }

        let mut highest = self.highest_in.lock().unwrap_or_else(|e| e.into_inner());
        match *highest {
            None => {
                *highest = Some(t);
                Ok(())
            }
            Some(seen) if t == seen => Err(SessionError::ImmediateDuplicateFrame),
            // Wrapping order: t is newer when the forward distance is short.
            Some(seen) if t.wrapping_sub(seen) >= 0x8000_0000 => Err(SessionError::DelayedFrame),
            Some(_) => {
                *highest = Some(t);
                Ok(())
            }
        }
    }
}

/// Result of taking the next outgoing integer sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextSeq {
    /// The sequence to stamp into the frame.
    pub seq: u32,
    /// The counter wrapped: the caller must roll its key before sealing.
    pub rollover: bool,
}

/// Outgoing integer sequence. Sequence 0 is never handed out; the wrap from
/// the maximum goes straight to 1 and reports the rollover, consuming a
/// single sequence.
#[derive(Debug, Default)]
pub struct SeqOutbound {
    counter: u32,
}

impl SeqOutbound {
    /// Advance and return the next sequence.
    pub fn next(&mut self) -> NextSeq {
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            self.counter = 1;
            NextSeq { seq: 1, rollover: true }
        } else {
            NextSeq {
                seq: self.counter,
                rollover: false,
            }
        }
    }

    /// Reset the counter, as after a sibling handler's rollover.
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Pin the counter. Test support.
    pub fn set(&mut self, value: u32) {
        self.counter = value;
    }

    /// The last sequence handed out.
    pub fn current(&self) -> u32 {
        self.counter
    }
}

/// Incoming integer sequence with a 64-slot replay bitmap below the highest
/// sequence seen.
#[derive(Debug, Default)]
pub struct SeqInbound {
    highest: u32,
    bitmap: u64,
}

impl SeqInbound {
    /// The highest sequence accepted so far.
    pub fn highest(&self) -> u32 {
        self.highest
    }

    /// Whether `seq` looks like the sender rolled its key: the counter was
    /// about to wrap and a small sequence arrived.
    pub fn rollover_suspected(&self, seq: u32) -> bool {
        self.highest >= ROLLOVER_THRESHOLD && seq <= ROLLOVER_GRACE
    }

    /// Reset after a confirmed key rollover.
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
    }

    /// Check `seq` without mutating state. A frame passing this check must
    /// still be registered after authentication succeeds.
    pub fn precheck(&self, seq: u32) -> Result<()> {
        self.evaluate(seq).map(|_| ())
    }

    /// Check and record `seq`.
    pub fn register(&mut self, seq: u32) -> Result<()> {
        match self.evaluate(seq)? {
            Position::Ahead(shift) => {
                self.bitmap = self
                    .bitmap
                    .checked_shl(shift)
                    .unwrap_or(0)
                    | 1u64.checked_shl(shift - 1).unwrap_or(0);
                self.highest = seq;
            }
            Position::Window(bit) => {
                self.bitmap |= bit;
            }
        }
        Ok(())
    }

    fn evaluate(&self, seq: u32) -> Result<Position> {
        if seq == self.highest {
            return Err(SessionError::ImmediateDuplicateFrame);
        }
        if seq > self.highest {
            return Ok(Position::Ahead(seq - self.highest));
        }
        let behind = self.highest - seq;
        if behind >= REPLAY_WINDOW {
            return Err(SessionError::DelayedFrame);
        }
        let bit = 1u64 << (behind - 1);
        if self.bitmap & bit != 0 {
            return Err(SessionError::DelayedDuplicateFrame);
        }
        Ok(Position::Window(bit))
    }
}

enum Position {
    /// Strictly ahead of the highest by this distance.
    Ahead(u32),
    /// Inside the replay window; the bit to mark.
    Window(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_sequence_is_monotonic() {
        let seq = TimeSequence::new();
        let mut last = 0;
        for _ in 0..100 {
            let next = seq.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_time_sequence_check() {
        let seq = TimeSequence::new();
        let t = now_ms() as u32;
        assert!(seq.check(t).is_ok());
        assert!(matches!(
            seq.check(t),
            Err(SessionError::ImmediateDuplicateFrame)
        ));
        assert!(matches!(seq.check(t - 1), Err(SessionError::DelayedFrame)));
        assert!(seq.check(t + 1).is_ok());
    }

    #[test]
    fn test_time_sequence_freshness_window() {
        let seq = TimeSequence::new();
        let t = now_ms() as u32;
        assert!(matches!(
            seq.check(t.wrapping_sub(MAX_FRAME_AGE_MS + 1000)),
            Err(SessionError::TooOldFrame)
        ));
        assert!(matches!(
            seq.check(t.wrapping_add(MAX_CLOCK_SKEW_MS + 1000)),
            Err(SessionError::TooNewFrame)
        ));
        // Small skew stays acceptable.
        assert!(seq.check(t.wrapping_add(500)).is_ok());
    }

    #[test]
    fn test_outbound_counts_from_one() {
        let mut out = SeqOutbound::default();
        assert_eq!(out.next(), NextSeq { seq: 1, rollover: false });
        assert_eq!(out.next(), NextSeq { seq: 2, rollover: false });
    }

    #[test]
    fn test_outbound_wrap_skips_zero() {
        let mut out = SeqOutbound::default();
        out.set(u32::MAX - 1);
        assert_eq!(out.next(), NextSeq { seq: u32::MAX, rollover: false });
        assert_eq!(out.next(), NextSeq { seq: 1, rollover: true });
        assert_eq!(out.next(), NextSeq { seq: 2, rollover: false });
    }

    #[test]
    fn test_inbound_reordering_within_window() {
        let mut inbound = SeqInbound::default();
        for seq in [1u32, 3, 2, 4] {
            assert!(inbound.register(seq).is_ok(), "seq {seq}");
        }
        assert!(matches!(
            inbound.register(2),
            Err(SessionError::DelayedDuplicateFrame)
        ));
        assert!(matches!(
            inbound.register(4),
            Err(SessionError::ImmediateDuplicateFrame)
        ));
    }

    #[test]
    fn test_inbound_window_limit() {
        let mut inbound = SeqInbound::default();
        assert!(inbound.register(100).is_ok());
        // 100 - 36 = 64 behind: outside the window.
        assert!(matches!(
            inbound.register(36),
            Err(SessionError::DelayedFrame)
        ));
        // 63 behind: inside.
        assert!(inbound.register(37).is_ok());
    }

    #[test]
    fn test_inbound_large_jump_clears_bitmap() {
        let mut inbound = SeqInbound::default();
        assert!(inbound.register(1).is_ok());
        assert!(inbound.register(1000).is_ok());
        // 1 is far outside the window now.
        assert!(matches!(inbound.register(1), Err(SessionError::DelayedFrame)));
        // 999 was never seen and is inside the window.
        assert!(inbound.register(999).is_ok());
    }

    #[test]
    fn test_rollover_suspected() {
        let mut inbound = SeqInbound::default();
        assert!(inbound.register(ROLLOVER_THRESHOLD + 5).is_ok());
        assert!(inbound.rollover_suspected(1));
        assert!(inbound.rollover_suspected(255));
        assert!(!inbound.rollover_suspected(256));
        inbound.reset();
        assert!(!inbound.rollover_suspected(1));
    }

    #[test]
    fn test_precheck_does_not_mutate() {
        let mut inbound = SeqInbound::default();
        assert!(inbound.precheck(5).is_ok());
        assert!(inbound.precheck(5).is_ok());
        assert!(inbound.register(5).is_ok());
        assert!(inbound.precheck(5).is_err());
    }
}

//! Temporary fidelity reduction for clients that keep falling behind.

use std::time::{Duration, Instant};

/// Consecutive superseded frames after which a client counts as backed up.
pub const BACKOFF_STREAK: u32 = 3;
/// Backoff never raises decimation past this.
pub const MAX_BACKOFF_DECIMATION: usize = 8;
/// A raised decimation holds this long after the last raise.
pub const BACKOFF_HOLD: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) struct Backoff {
    factor: usize,
    streak: u32,
    until: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            factor: 1,
            streak: 0,
            until: None,
        }
    }
}

impl Backoff {
    pub fn apply(&self, base: usize) -> usize {
        if self.factor <= 1 {
            return base;
        }
        (base * self.factor).min(MAX_BACKOFF_DECIMATION).max(base)
    }

    /// Drops back to the preset once the hold ran out; true if it did.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.until {
            Some(until) if now >= until => {
                *self = Self::default();
                true
            }
            _ => false,
        }
    }

    /// Records one publish. Returns the raised decimation when this publish
    /// completed a streak of superseded frames and there was room to raise.
    pub fn record(&mut self, superseded: bool, base: usize, now: Instant) -> Option<usize> {
        if !superseded {
            self.streak = 0;
            return None;
        }
        self.streak += 1;
        if self.streak < BACKOFF_STREAK {
            return None;
        }
        self.streak = 0;
        self.until = Some(now + BACKOFF_HOLD);
        if self.apply(base) >= MAX_BACKOFF_DECIMATION {
            return None;
        }
        self.factor *= 2;
        Some(self.apply(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streak(b: &mut Backoff, base: usize, now: Instant) -> Option<usize> {
        let mut raised = None;
        for _ in 0..BACKOFF_STREAK {
            raised = b.record(true, base, now);
        }
        raised
    }

    #[test]
    fn doubles_up_to_the_cap() {
        let now = Instant::now();
        let mut b = Backoff::default();
        assert_eq!(b.apply(1), 1);
        assert_eq!(streak(&mut b, 1, now), Some(2));
        assert_eq!(streak(&mut b, 1, now), Some(4));
        assert_eq!(streak(&mut b, 1, now), Some(8));
        assert_eq!(streak(&mut b, 1, now), None);
        assert_eq!(b.apply(1), 8);
    }

    #[test]
    fn keeping_up_breaks_the_streak() {
        let now = Instant::now();
        let mut b = Backoff::default();
        b.record(true, 2, now);
        b.record(true, 2, now);
        assert_eq!(b.record(false, 2, now), None);
        assert_eq!(b.record(true, 2, now), None);
        assert_eq!(b.apply(2), 2);
    }

    #[test]
    fn preset_comes_back_after_the_hold() {
        let now = Instant::now();
        let mut b = Backoff::default();
        assert_eq!(streak(&mut b, 4, now), Some(8));
        assert!(!b.expire(now + BACKOFF_HOLD / 2));
        assert_eq!(b.apply(4), 8);
        assert!(b.expire(now + BACKOFF_HOLD));
        assert_eq!(b.apply(4), 4);
        assert!(!b.expire(now + BACKOFF_HOLD * 2));
    }

    #[test]
    fn a_new_raise_extends_the_hold() {
        let now = Instant::now();
        let mut b = Backoff::default();
        streak(&mut b, 1, now);
        let later = now + BACKOFF_HOLD - Duration::from_millis(10);
        assert_eq!(streak(&mut b, 1, later), Some(4));
        assert!(!b.expire(now + BACKOFF_HOLD));
        assert!(b.expire(later + BACKOFF_HOLD));
    }
}

//! Simulation time.
//!
//! A [`Tick`] is a wrapping 32-bit step index. Ordering is only meaningful
//! inside a bounded horizon (well under `2^31` ticks), which every
//! per-entity history respects because ring capacities are tiny by comparison.
//! Use [`Tick::is_newer_than`] rather than comparing raw values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discrete simulation step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tick(u32);

impl Tick {
    /// Tick zero. A valid tick, not a sentinel: absence is `Option<Tick>`.
    pub const ZERO: Self = Self(0);

    /// Longest forward distance that still orders after `self`.
    pub const MAX_SPAN: u32 = i32::MAX as u32;

    /// Wrap a raw tick index.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw tick index.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// `true` if `self` is strictly ahead of `other` under wraparound.
    #[must_use]
    pub const fn is_newer_than(self, other: Self) -> bool {
        self.ticks_since(other) > 0
    }

    /// `true` if `self` is at or ahead of `other` under wraparound.
    #[must_use]
    pub const fn is_at_or_after(self, other: Self) -> bool {
        self.ticks_since(other) >= 0
    }

    /// Signed distance from `other` to `self`.
    ///
    /// Positive when `self` is newer.
    #[must_use]
    pub const fn ticks_since(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Tick `n` steps later.
    #[must_use]
    pub const fn add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Tick `n` steps earlier.
    #[must_use]
    pub const fn subtract(self, n: u32) -> Self {
        Self(self.0.wrapping_sub(n))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-function form of [`Tick::is_newer_than`].
#[must_use]
pub const fn is_newer(a: Tick, b: Tick) -> bool {
    a.is_newer_than(b)
}

/// Monotonic step clock owned by one world.
///
/// `advance` is called exactly once per simulation pass. When the host is
/// running behind it may cover several ticks in a single pass
/// ([`TickClock::advance_batch`]); the clock records the batch so cooldown
/// probes can look back across the ticks that were skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickClock {
    current: Tick,
    batch_size: u32,
    passes: u64,
}

impl TickClock {
    /// Clock positioned at `start`. No pass has run yet.
    #[must_use]
    pub const fn starting_at(start: Tick) -> Self {
        Self {
            current: start,
            batch_size: 1,
            passes: 0,
        }
    }

    /// Current tick.
    #[must_use]
    pub const fn current(&self) -> Tick {
        self.current
    }

    /// Number of ticks the most recent pass covered.
    #[must_use]
    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Ticks skipped by the most recent pass (batch size minus one).
    #[must_use]
    pub const fn skipped(&self) -> u32 {
        self.batch_size.saturating_sub(1)
    }

    /// Total passes run.
    #[must_use]
    pub const fn passes(&self) -> u64 {
        self.passes
    }

    /// Advance one tick.
    pub fn advance(&mut self) -> Tick {
        self.advance_batch(1)
    }

    /// Advance `ticks` ticks in one pass. A batch of zero is treated as one.
    pub fn advance_batch(&mut self, ticks: u32) -> Tick {
        let ticks = ticks.max(1);
        self.current = self.current.add(ticks);
        self.batch_size = ticks;
        self.passes += 1;
        if ticks > 1 {
            tracing::debug!(
                tick = %self.current,
                skipped = ticks - 1,
                "clock advanced by a batch"
            );
        }
        self.current
    }

    /// Per-step time view for the current tick.
    #[must_use]
    pub const fn network_time(&self, first_full_tick: bool) -> NetworkTime {
        NetworkTime {
            server_tick: self.current,
            batch_size: self.batch_size,
            first_full_tick,
        }
    }
}

/// Time information handed to every stage of one simulation pass.
///
/// Supplied by the transport layer on clients and by the local clock on the
/// server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTime {
    /// Tick being simulated.
    pub server_tick: Tick,
    /// Ticks covered by this pass.
    pub batch_size: u32,
    /// `true` the first time this tick is fully simulated; `false` for
    /// repeated or partial passes over the same tick.
    pub first_full_tick: bool,
}

impl NetworkTime {
    /// A single full pass over `tick`.
    #[must_use]
    pub const fn full(tick: Tick) -> Self {
        Self {
            server_tick: tick,
            batch_size: 1,
            first_full_tick: true,
        }
    }

    /// A repeated pass over `tick` that must not re-run prediction-only logic.
    #[must_use]
    pub const fn repeat(tick: Tick) -> Self {
        Self {
            server_tick: tick,
            batch_size: 1,
            first_full_tick: false,
        }
    }

    /// Gate for prediction-only logic (ability commit, cooldown writes).
    #[must_use]
    pub const fn is_first_full_tick(&self) -> bool {
        self.first_full_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer_across_wraparound() {
        let before_wrap = Tick::new(u32::MAX - 1);
        let after_wrap = Tick::new(2);

        assert!(after_wrap.is_newer_than(before_wrap));
        assert!(!before_wrap.is_newer_than(after_wrap));
        assert_eq!(after_wrap.ticks_since(before_wrap), 4);
        assert!(!Tick::new(7).is_newer_than(Tick::new(7)));
        assert!(Tick::new(7).is_at_or_after(Tick::new(7)));
    }

    #[test]
    fn test_add_subtract_wrap() {
        assert_eq!(Tick::new(u32::MAX).add(1), Tick::ZERO);
        assert_eq!(Tick::ZERO.subtract(1), Tick::new(u32::MAX));
        assert_eq!(Tick::new(100).add(90).subtract(90), Tick::new(100));
        assert!(Tick::new(5).add(Tick::MAX_SPAN).is_newer_than(Tick::new(5)));
        assert!(!Tick::new(5).add(Tick::MAX_SPAN + 1).is_newer_than(Tick::new(5)));
    }

    #[test]
    fn test_clock_tracks_batches() {
        let mut clock = TickClock::starting_at(Tick::new(10));
        assert_eq!(clock.advance(), Tick::new(11));
        assert_eq!(clock.skipped(), 0);

        assert_eq!(clock.advance_batch(3), Tick::new(14));
        assert_eq!(clock.batch_size(), 3);
        assert_eq!(clock.skipped(), 2);
        assert_eq!(clock.passes(), 2);

        clock.advance_batch(0);
        assert_eq!(clock.current(), Tick::new(15));
        assert_eq!(clock.batch_size(), 1);
    }
}

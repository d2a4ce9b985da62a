//! One-shot events keyed to an absolute future tick.

use serde::{Deserialize, Serialize};

use crate::tick::Tick;

/// An event waiting for its tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledEvent<P> {
    /// Tick at or after which the event fires.
    pub fire_at: Tick,
    /// What happens when it fires.
    pub payload: P,
}

/// Pending one-shot events.
///
/// Entries fire in `fire_at` order (scheduling order breaks ties) and are
/// removed as they fire, so each fires exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scheduler<P> {
    entries: Vec<ScheduledEvent<P>>,
}

impl<P> Default for Scheduler<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P> Scheduler<P> {
    /// Empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event for `fire_at`.
    pub fn schedule(&mut self, fire_at: Tick, payload: P) {
        self.entries.push(ScheduledEvent { fire_at, payload });
    }

    /// Remove and return every event due at `current`, earliest first.
    pub fn drain_due(&mut self, current: Tick) -> Vec<P> {
        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if current.is_at_or_after(entry.fire_at) {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.entries = remaining;
        // Stable sort keeps scheduling order for equal ticks.
        due.sort_by_key(|entry| entry.fire_at.ticks_since(current));
        due.into_iter().map(|entry| entry.payload).collect()
    }

    /// Pending events, in scheduling order.
    pub fn pending(&self) -> impl Iterator<Item = &ScheduledEvent<P>> {
        self.entries.iter()
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop pending events matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&P) -> bool) {
        self.entries.retain(|entry| !predicate(&entry.payload));
    }
}

/// Whole seconds left until `fire_at`, rounded up and never negative.
#[must_use]
pub fn countdown_seconds(fire_at: Tick, current: Tick, tick_rate: u32) -> u32 {
    let remaining = fire_at.ticks_since(current);
    if remaining <= 0 || tick_rate == 0 {
        return 0;
    }
    (remaining as u32).div_ceil(tick_rate)
}

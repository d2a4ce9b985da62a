//! Per-entity tick-indexed history.
//!
//! A [`CommandRing`] keeps the last `capacity` values written for an entity,
//! one per tick, sorted ascending. Reads are "as of" a tick: the entry with the
//! greatest tick at or before the query. Writing a tick that is already present
//! replaces that entry, so a resimulated tick reproduces its value instead of
//! stacking a second one.
//!
//! When the ring is full the oldest entry is dropped and counted in
//! [`CommandRing::evicted`]. Capacity must exceed the longest resimulation
//! window; a query older than the oldest retained entry falls back to the
//! caller's default, which for cooldowns means "never used".

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::tick::Tick;

/// One value recorded for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingEntry<T> {
    /// Tick the value is valid from.
    pub tick: Tick,
    /// Recorded value.
    pub value: T,
}

impl<T> RingEntry<T> {
    /// Pair a value with its tick.
    #[must_use]
    pub const fn new(tick: Tick, value: T) -> Self {
        Self { tick, value }
    }
}

/// Fixed-capacity, tick-ordered history owned by a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandRing<T> {
    entries: VecDeque<RingEntry<T>>,
    capacity: usize,
    evicted: u64,
}

impl<T> CommandRing<T> {
    /// Empty ring holding at most `capacity` ticks. A capacity of zero is
    /// raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Maximum number of retained ticks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing has been written (or everything was evicted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped because the ring was full.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Record `value` for `tick`, replacing any entry for the same tick.
    ///
    /// Returns `true` if an existing entry was overwritten.
    pub fn write(&mut self, tick: Tick, value: T) -> bool {
        // Walk from the back: almost every write is for the newest tick.
        let mut insert_at = self.entries.len();
        while insert_at > 0 {
            let existing = self.entries[insert_at - 1].tick;
            if existing == tick {
                self.entries[insert_at - 1].value = value;
                self.validate_order();
                return true;
            }
            if tick.is_newer_than(existing) {
                break;
            }
            insert_at -= 1;
        }

        self.entries.insert(insert_at, RingEntry::new(tick, value));
        while self.entries.len() > self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                self.evicted += 1;
                tracing::trace!(tick = %dropped.tick, "history entry evicted");
            }
        }
        self.validate_order();
        false
    }

    /// Entry with the greatest tick at or before `tick`.
    #[must_use]
    pub fn read_as_of(&self, tick: Tick) -> Option<&RingEntry<T>> {
        self.entries
            .iter()
            .rev()
            .find(|entry| tick.is_at_or_after(entry.tick))
    }

    /// Entry recorded for exactly `tick`.
    #[must_use]
    pub fn entry_at(&self, tick: Tick) -> Option<&RingEntry<T>> {
        self.entries.iter().rev().find(|entry| entry.tick == tick)
    }

    /// `true` if an entry exists for exactly `tick`.
    #[must_use]
    pub fn contains_tick(&self, tick: Tick) -> bool {
        self.entry_at(tick).is_some()
    }

    /// Most recent entry.
    #[must_use]
    pub fn latest(&self) -> Option<&RingEntry<T>> {
        self.entries.back()
    }

    /// Oldest retained entry.
    #[must_use]
    pub fn oldest(&self) -> Option<&RingEntry<T>> {
        self.entries.front()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingEntry<T>> {
        self.entries.iter()
    }

    /// Iterate entries strictly newer than `tick`, oldest first.
    pub fn entries_after(&self, tick: Tick) -> impl Iterator<Item = &RingEntry<T>> {
        self.entries
            .iter()
            .filter(move |entry| entry.tick.is_newer_than(tick))
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(any(debug_assertions, feature = "debug-validation"))]
    fn validate_order(&self) {
        let ordered = self
            .entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| b.tick.is_newer_than(a.tick));
        debug_assert!(ordered, "history ring out of tick order");
    }

    #[cfg(not(any(debug_assertions, feature = "debug-validation")))]
    #[inline]
    fn validate_order(&self) {}
}

impl<T: Clone> CommandRing<T> {
    /// Value valid at `tick`, or `default` if nothing at or before it is
    /// retained.
    #[must_use]
    pub fn value_as_of_or(&self, tick: Tick, default: T) -> T {
        self.read_as_of(tick)
            .map_or(default, |entry| entry.value.clone())
    }
}

impl<T: Clone + Default> CommandRing<T> {
    /// Value valid at `tick`, or `T::default()`.
    #[must_use]
    pub fn value_as_of(&self, tick: Tick) -> T {
        self.value_as_of_or(tick, T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(n: u32) -> Tick {
        Tick::new(n)
    }

    #[test]
    fn test_read_as_of_picks_greatest_at_or_before() {
        let mut ring = CommandRing::with_capacity(8);
        ring.write(t(10), 'a');
        ring.write(t(14), 'b');
        ring.write(t(20), 'c');

        assert_eq!(ring.read_as_of(t(9)), None);
        assert_eq!(ring.read_as_of(t(10)).map(|e| e.value), Some('a'));
        assert_eq!(ring.read_as_of(t(13)).map(|e| e.value), Some('a'));
        assert_eq!(ring.read_as_of(t(19)).map(|e| e.value), Some('b'));
        assert_eq!(ring.read_as_of(t(500)).map(|e| e.value), Some('c'));
        assert_eq!(ring.value_as_of_or(t(3), 'z'), 'z');
    }

    #[test]
    fn test_same_tick_overwrites() {
        let mut ring = CommandRing::with_capacity(4);
        assert!(!ring.write(t(5), 1));
        assert!(ring.write(t(5), 2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.value_as_of(t(5)), 2);
    }

    #[test]
    fn test_out_of_order_write_is_sorted() {
        let mut ring = CommandRing::with_capacity(8);
        ring.write(t(30), 3);
        ring.write(t(10), 1);
        ring.write(t(20), 2);

        let ticks: Vec<u32> = ring.iter().map(|e| e.tick.get()).collect();
        assert_eq!(ticks, vec![10, 20, 30]);
        assert_eq!(ring.value_as_of(t(25)), 2);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let mut ring = CommandRing::with_capacity(3);
        for n in 1..=5 {
            ring.write(t(n), n);
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.evicted(), 2);
        assert_eq!(ring.oldest().map(|e| e.tick), Some(t(3)));
        // History before the window is gone.
        assert_eq!(ring.read_as_of(t(2)), None);
    }

    #[test]
    fn test_ordering_across_wraparound() {
        let mut ring = CommandRing::with_capacity(4);
        ring.write(t(u32::MAX - 1), 'x');
        ring.write(t(1), 'y');

        assert_eq!(ring.read_as_of(t(u32::MAX)).map(|e| e.value), Some('x'));
        assert_eq!(ring.read_as_of(t(0)).map(|e| e.value), Some('x'));
        assert_eq!(ring.read_as_of(t(1)).map(|e| e.value), Some('y'));
    }

    #[test]
    fn test_entries_after() {
        let mut ring = CommandRing::with_capacity(8);
        for n in [2, 4, 6, 8] {
            ring.write(t(n), n);
        }
        let newer: Vec<u32> = ring.entries_after(t(4)).map(|e| e.value).collect();
        assert_eq!(newer, vec![6, 8]);
    }

    proptest! {
        #[test]
        fn prop_read_as_of_matches_reference(
            writes in prop::collection::vec((0u32..200, any::<i32>()), 0..64),
            query in 0u32..220,
        ) {
            let mut ring = CommandRing::with_capacity(256);
            let mut reference = std::collections::BTreeMap::new();
            for (tick, value) in &writes {
                ring.write(t(*tick), *value);
                reference.insert(*tick, *value);
            }

            let expected = reference.range(..=query).next_back().map(|(k, v)| (*k, *v));
            let actual = ring.read_as_of(t(query)).map(|e| (e.tick.get(), e.value));
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(ring.len(), reference.len());
        }
    }
}

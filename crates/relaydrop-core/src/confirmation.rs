//! Delivery confirmations.
//!
//! A confirmation is a receiver's statement that it holds every chunk of a
//! file. Confirmations may arrive more than once (rejoin, duplicated
//! delivery), so each file tracks a set of receivers rather than a count.

use std::collections::{BTreeMap, BTreeSet};

/// Receivers that confirmed one file.
///
/// Insertion is idempotent and the set only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationSet {
    receivers: BTreeSet<u64>,
}

impl ConfirmationSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `receiver`. Returns true if it was not already present.
    pub fn insert(&mut self, receiver: u64) -> bool {
        self.receivers.insert(receiver)
    }

    /// Whether `receiver` has confirmed.
    #[must_use]
    pub fn contains(&self, receiver: u64) -> bool {
        self.receivers.contains(&receiver)
    }

    /// Number of distinct receivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    /// No receiver has confirmed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Receivers in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.receivers.iter().copied()
    }
}

/// Per-file confirmation sets for one room.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationAggregator {
    files: BTreeMap<u32, ConfirmationSet>,
}

impl ConfirmationAggregator {
    /// Aggregator with no confirmations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `receiver` holds all of `file_index`.
    ///
    /// Returns the number of distinct receivers that have confirmed the file.
    pub fn record_confirmation(&mut self, file_index: u32, receiver: u64) -> usize {
        let set = self.files.entry(file_index).or_default();
        set.insert(receiver);
        set.len()
    }

    /// Confirmation set for `file_index`, if anyone confirmed it.
    #[must_use]
    pub fn confirmed_by(&self, file_index: u32) -> Option<&ConfirmationSet> {
        self.files.get(&file_index)
    }

    /// Number of receivers that confirmed `file_index`.
    #[must_use]
    pub fn confirmation_count(&self, file_index: u32) -> usize {
        self.files.get(&file_index).map_or(0, ConfirmationSet::len)
    }

    /// Whether at least `expected` receivers confirmed `file_index`.
    #[must_use]
    pub fn is_fully_confirmed(&self, file_index: u32, expected: usize) -> bool {
        self.confirmation_count(file_index) >= expected
    }

    /// Drop every set. Only called when the room is destroyed.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn repeated_confirmation_counts_once() {
        let mut agg = ConfirmationAggregator::new();

        assert_eq!(agg.record_confirmation(0, 7), 1);
        assert_eq!(agg.record_confirmation(0, 7), 1);
        assert_eq!(agg.record_confirmation(0, 8), 2);
        assert_eq!(agg.record_confirmation(1, 7), 1);

        assert!(agg.confirmed_by(0).unwrap().contains(8));
        assert_eq!(agg.confirmation_count(2), 0);
        assert!(agg.confirmed_by(2).is_none());
    }

    #[test]
    fn fully_confirmed_threshold() {
        let mut agg = ConfirmationAggregator::new();
        agg.record_confirmation(0, 1);

        assert!(agg.is_fully_confirmed(0, 1));
        assert!(!agg.is_fully_confirmed(0, 2));
    }

    proptest! {
        #[test]
        fn set_size_equals_distinct_receivers(
            confirmations in prop::collection::vec((0u32..4, 1u64..6), 0..64),
        ) {
            let mut agg = ConfirmationAggregator::new();
            let mut previous: BTreeMap<u32, usize> = BTreeMap::new();

            for (file, receiver) in &confirmations {
                let size = agg.record_confirmation(*file, *receiver);
                // Monotone per file
                prop_assert!(size >= previous.get(file).copied().unwrap_or(0));
                previous.insert(*file, size);
            }

            for file in 0u32..4 {
                let distinct: BTreeSet<u64> = confirmations
                    .iter()
                    .filter(|(f, _)| *f == file)
                    .map(|(_, r)| *r)
                    .collect();
                prop_assert_eq!(agg.confirmation_count(file), distinct.len());
            }
        }
    }
}

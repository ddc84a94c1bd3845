//! Identifier providers for offline ids and download guids.
//!
//! The creating components receive an [`IdProvider`] explicitly instead of
//! reaching for process-wide random state.

use std::sync::atomic::{AtomicI64, Ordering};

use rand::Rng;

/// Generates identifiers for new items and new download cycles.
pub trait IdProvider: Send + Sync {
    /// Returns a fresh, positive offline id.
    fn next_offline_id(&self) -> i64;

    /// Returns a fresh guid for one push/download cycle.
    fn next_guid(&self) -> String;
}

/// Random ids (offline ids) and UUIDv4 guids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn next_offline_id(&self) -> i64 {
        rand::thread_rng().gen_range(1..i64::MAX)
    }

    fn next_guid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic, monotonically increasing ids for tests.
#[derive(Debug)]
pub struct SequentialIds {
    next_id: AtomicI64,
    next_guid: AtomicI64,
}

impl SequentialIds {
    /// Starts both sequences at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Starts both sequences at `first`.
    #[must_use]
    pub fn starting_at(first: i64) -> Self {
        Self {
            next_id: AtomicI64::new(first),
            next_guid: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for SequentialIds {
    fn next_offline_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn next_guid(&self) -> String {
        format!("guid-{}", self.next_guid.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_random_ids_are_positive_and_distinct() {
        let ids = RandomIdProvider;
        let generated: HashSet<i64> = (0..1000).map(|_| ids.next_offline_id()).collect();
        assert_eq!(generated.len(), 1000);
        assert!(generated.iter().all(|id| *id > 0));
    }

    #[test]
    fn test_random_guids_are_uuids() {
        let guid = RandomIdProvider.next_guid();
        assert!(uuid::Uuid::parse_str(&guid).is_ok(), "not a uuid: {guid}");
    }

    #[test]
    fn test_sequential_ids_increment() {
        let ids = SequentialIds::starting_at(10);
        assert_eq!(ids.next_offline_id(), 10);
        assert_eq!(ids.next_offline_id(), 11);
        assert_eq!(ids.next_guid(), "guid-10");
        assert_eq!(ids.next_guid(), "guid-11");
    }
}

//! Engine counters.
//!
//! Cheap shared counters the embedding can poll for diagnostics without
//! talking to the owner loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Counters for everything the engine has seen and done.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Events admitted per kind.
    pub ingested_by_kind: HashMap<u16, u64>,
    /// Total events received from relays, including duplicates.
    pub received: u64,
    /// Events that changed no entity state: duplicate ids, stale
    /// replaceables, unknown kinds.
    pub duplicates: u64,
    /// Events dropped before reconciliation (verification, tombstones).
    pub dropped: u64,
    /// Subscriptions opened / fully closed.
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
}

impl EngineStats {
    pub fn record_received(&mut self, kind: u16) {
        self.received += 1;
        *self.ingested_by_kind.entry(kind).or_insert(0) += 1;
    }

    /// Kinds sorted by received count, descending.
    pub fn kinds_by_count(&self) -> Vec<(u16, u64)> {
        let mut kinds: Vec<_> = self
            .ingested_by_kind
            .iter()
            .map(|(&k, &c)| (k, c))
            .collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1));
        kinds
    }
}

/// Thread-safe handle over [`EngineStats`].
#[derive(Debug, Clone, Default)]
pub struct SharedEngineStats {
    inner: Arc<RwLock<EngineStats>>,
}

impl SharedEngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, kind: u16) {
        self.inner.write().record_received(kind);
    }

    pub fn record_duplicate(&self) {
        self.inner.write().duplicates += 1;
    }

    pub fn record_dropped(&self) {
        self.inner.write().dropped += 1;
    }

    pub fn record_subscription_opened(&self) {
        self.inner.write().subscriptions_opened += 1;
    }

    pub fn record_subscription_closed(&self) {
        self.inner.write().subscriptions_closed += 1;
    }

    pub fn snapshot(&self) -> EngineStats {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let stats = SharedEngineStats::new();
        stats.record_received(0);
        stats.record_received(0);
        stats.record_received(30311);
        stats.record_duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 3);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.kinds_by_count()[0], (0, 2));
    }
}

//! Record cache boundary.
//!
//! Durable storage of raw events is an external collaborator; the engine
//! only needs a keyed store that remembers each event and the growing set
//! of relays it has been confirmed present on. A record with an empty
//! seen-set is an unpublished local event awaiting its first confirmation.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::Event;

/// A cached raw event plus the relay urls it is known to exist on.
#[derive(Debug, Clone)]
pub struct PersistedRecord {
    pub event: Event,
    pub seen_on: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub trait EventStore: Send {
    fn persist(&mut self, event: &Event, seen_on: &[String]) -> Result<(), StoreError>;

    fn lookup(&self, event_id: &str) -> Option<PersistedRecord>;

    /// Append a relay to a record's seen-set. Returns true when the relay
    /// was not already present.
    fn mark_seen(&mut self, event_id: &str, relay_url: &str) -> bool;

    fn remove(&mut self, event_id: &str);

    /// Records never confirmed on any relay, candidates for re-broadcast.
    fn list_unpublished(&self) -> Vec<PersistedRecord>;

    /// Full snapshot, used to replay cached state through the reconciler
    /// at startup.
    fn list_all(&self) -> Vec<PersistedRecord>;
}

/// In-memory store; the default when no durable backend is wired in.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    records: HashMap<String, PersistedRecord>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryEventStore {
    fn persist(&mut self, event: &Event, seen_on: &[String]) -> Result<(), StoreError> {
        self.records
            .entry(event.id.clone())
            .or_insert_with(|| PersistedRecord {
                event: event.clone(),
                seen_on: seen_on.to_vec(),
            });
        Ok(())
    }

    fn lookup(&self, event_id: &str) -> Option<PersistedRecord> {
        self.records.get(event_id).cloned()
    }

    fn mark_seen(&mut self, event_id: &str, relay_url: &str) -> bool {
        match self.records.get_mut(event_id) {
            Some(record) if !record.seen_on.iter().any(|url| url == relay_url) => {
                record.seen_on.push(relay_url.to_string());
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, event_id: &str) {
        self.records.remove(event_id);
    }

    fn list_unpublished(&self) -> Vec<PersistedRecord> {
        self.records
            .values()
            .filter(|record| record.seen_on.is_empty())
            .cloned()
            .collect()
    }

    fn list_all(&self) -> Vec<PersistedRecord> {
        self.records.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: "ab".into(),
            kind: 1,
            created_at: 7,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn persist_is_idempotent_on_content() {
        let mut store = MemoryEventStore::new();
        store.persist(&event("aa"), &["ws://a".into()]).unwrap();
        store.persist(&event("aa"), &["ws://b".into()]).unwrap();
        // Second persist does not replace the record or its seen-set.
        assert_eq!(store.lookup("aa").unwrap().seen_on, vec!["ws://a"]);
    }

    #[test]
    fn mark_seen_appends_once() {
        let mut store = MemoryEventStore::new();
        store.persist(&event("aa"), &[]).unwrap();
        assert!(store.mark_seen("aa", "ws://a"));
        assert!(!store.mark_seen("aa", "ws://a"));
        assert_eq!(store.lookup("aa").unwrap().seen_on, vec!["ws://a"]);
    }

    #[test]
    fn unpublished_lists_empty_seen_sets() {
        let mut store = MemoryEventStore::new();
        store.persist(&event("aa"), &[]).unwrap();
        store.persist(&event("bb"), &["ws://a".into()]).unwrap();
        let unpublished = store.list_unpublished();
        assert_eq!(unpublished.len(), 1);
        assert_eq!(unpublished[0].event.id, "aa");
    }
}

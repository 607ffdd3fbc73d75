//! Subscription intents, refcounts, and watermarks.
//!
//! Decides, per logical intent, whether a new subscription is needed,
//! builds the incremental filter from per-relay watermarks, and
//! reference-counts in-flight subscriptions so an intent is never
//! duplicated while one is outstanding.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::constants::kinds;
use crate::relay::{Filter, FilterBuilder, RelayPool};
use crate::store::DataStore;

/// Per-relay-url high-water marks, used to compute the next `since` so
/// already-seen ranges are not re-requested.
#[derive(Debug, Default)]
pub struct Watermarks {
    pub last_bootstrapped: HashMap<String, u64>,
    pub last_pulled_activities: HashMap<String, u64>,
    pub last_pulled_from_follows: HashMap<String, u64>,
}

impl Watermarks {
    fn min_bootstrapped(&self) -> Option<u64> {
        self.last_bootstrapped.values().min().copied()
    }

    fn min_pulled_activities(&self) -> Option<u64> {
        self.last_pulled_activities.values().min().copied()
    }

    fn min_pulled_from_follows(&self) -> Option<u64> {
        self.last_pulled_from_follows.values().min().copied()
    }
}

/// A durable live-chat subscription for one activity coordinate. Unlike
/// the backfill intents it survives EOSE and is re-issued on reconnect.
#[derive(Debug)]
pub struct ChatSubscription {
    pub subscription_id: String,
    pub filter: Filter,
    refcount: usize,
}

/// What a closed subscription meant to the manager.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClosedOutcome {
    /// The id belonged to a tracked backfill intent.
    pub known: bool,
    /// The intent's refcount reached zero; the wire subscription should be
    /// CLOSEd.
    pub fully_closed: bool,
    /// The activity-refresh intent fully drained; metadata for activity
    /// authors should now be bulk-fetched.
    pub activity_refresh_drained: bool,
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    missing_metadata: HashMap<String, usize>, // subscription id -> refcount
    metadata_refresh: HashMap<String, usize>,
    bootstrap: HashMap<String, usize>,
    activity_refresh: HashMap<String, usize>,
    chats: HashMap<String, ChatSubscription>, // coordinate -> subscription
    pub watermarks: Watermarks,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch full history for authors we know nothing about, and refresh
    /// the rest incrementally. Mirrors the two-step pull: a missing-
    /// metadata fetch fires only when none is outstanding, and the refresh
    /// is skipped entirely while either intent is in flight.
    pub fn pull_missing_and_refresh(
        &mut self,
        pool: &RelayPool,
        data: &DataStore,
        pubkeys: &[String],
        now: u64,
    ) {
        if !pool.has_connected_read_relay() {
            return;
        }
        let until = now;

        let all: HashSet<&String> = pubkeys.iter().collect();
        let missing: Vec<String> = all
            .iter()
            .filter(|pk| !data.has_profile(pk))
            .map(|pk| (*pk).clone())
            .collect();

        if !missing.is_empty() && self.missing_metadata.is_empty() {
            let filter = FilterBuilder::new()
                .authors(missing.clone())
                .kinds([kinds::PROFILE, kinds::LIVE_ACTIVITY, kinds::DELETION])
                .until(until)
                .build();
            match filter {
                Ok(filter) => {
                    if let Some(id) = pool.subscribe(&filter) {
                        *self.missing_metadata.entry(id).or_insert(0) += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "unable to build missing-metadata filter");
                    return;
                }
            }
        }

        // Do not refresh while a fetch of either flavor is in flight.
        if !self.missing_metadata.is_empty() || !self.metadata_refresh.is_empty() {
            return;
        }

        let known: Vec<String> = all
            .iter()
            .filter(|pk| data.has_profile(pk))
            .map(|pk| (*pk).clone())
            .collect();
        if known.is_empty() {
            return;
        }

        let since = self
            .watermarks
            .min_pulled_from_follows()
            .map(|ts| ts + 1);
        let filter = FilterBuilder::new()
            .authors(known)
            .kinds([kinds::PROFILE, kinds::LIVE_ACTIVITY, kinds::DELETION])
            .maybe_since(since)
            .until(until)
            .build();
        match filter {
            Ok(filter) => {
                if let Some(id) = pool.subscribe(&filter) {
                    for url in pool.connected_read_urls() {
                        self.watermarks.last_pulled_from_follows.insert(url, until);
                    }
                    *self.metadata_refresh.entry(id).or_insert(0) += 1;
                }
            }
            Err(error) => {
                tracing::warn!(%error, "unable to build metadata refresh filter");
            }
        }
    }

    /// Bootstrap the local profile authors and refresh the global activity
    /// feed. `relay` limits the pull to one (freshly reconnected) relay;
    /// `hard` ignores watermarks and re-pulls full history.
    pub fn refresh(
        &mut self,
        pool: &RelayPool,
        data: &DataStore,
        relay: Option<&str>,
        hard: bool,
        now: u64,
    ) {
        match relay {
            None => {
                if !pool.has_connected_read_relay() {
                    return;
                }
            }
            Some(url) => {
                if !pool.read_relay_connected(url) {
                    return;
                }
            }
        }
        let until = now;

        if self.bootstrap.is_empty() {
            let authors: Vec<String> = data.local_pubkey().map(str::to_string).into_iter().collect();
            if !authors.is_empty() {
                let since = if hard {
                    None
                } else {
                    relay
                        .and_then(|url| self.watermarks.last_bootstrapped.get(url).copied())
                        .or_else(|| self.watermarks.min_bootstrapped())
                        .map(|ts| ts + 1)
                };
                let filter = FilterBuilder::new()
                    .authors(authors)
                    .kinds([
                        kinds::PROFILE,
                        kinds::FOLLOW_LIST,
                        kinds::LIVE_ACTIVITY,
                        kinds::DELETION,
                    ])
                    .maybe_since(since)
                    .until(until)
                    .build();
                match filter {
                    Ok(filter) => {
                        if let Some(id) = self.issue(pool, relay, &filter) {
                            // Single-relay re-pulls are not refcounted; only
                            // the pool-wide bootstrap blocks the intent.
                            if relay.is_none() {
                                *self.bootstrap.entry(id).or_insert(0) += 1;
                            }
                            self.advance(relay, pool, until, WatermarkKind::Bootstrapped);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "unable to build bootstrap filter");
                        return;
                    }
                }
            }
        }

        if self.activity_refresh.is_empty() {
            let since = if hard {
                None
            } else {
                relay
                    .and_then(|url| self.watermarks.last_pulled_activities.get(url).copied())
                    .or_else(|| self.watermarks.min_pulled_activities())
                    .map(|ts| ts + 1)
            };
            let filter = FilterBuilder::new()
                .kinds([kinds::LIVE_ACTIVITY])
                .maybe_since(since)
                .until(until)
                .build();
            match filter {
                Ok(filter) => {
                    if let Some(id) = self.issue(pool, relay, &filter) {
                        *self.activity_refresh.entry(id).or_insert(0) += 1;
                        self.advance(relay, pool, until, WatermarkKind::PulledActivities);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "unable to build activity refresh filter");
                }
            }
        }
    }

    fn issue(&self, pool: &RelayPool, relay: Option<&str>, filter: &Filter) -> Option<String> {
        match relay {
            None => pool.subscribe(filter),
            Some(url) => {
                let id = Uuid::new_v4().to_string();
                pool.subscribe_on(url, &id, filter).then_some(id)
            }
        }
    }

    fn advance(&mut self, relay: Option<&str>, pool: &RelayPool, until: u64, kind: WatermarkKind) {
        let urls: Vec<String> = match relay {
            Some(url) => vec![url.to_string()],
            None => pool.connected_read_urls(),
        };
        let map = match kind {
            WatermarkKind::Bootstrapped => &mut self.watermarks.last_bootstrapped,
            WatermarkKind::PulledActivities => &mut self.watermarks.last_pulled_activities,
        };
        for url in urls {
            map.insert(url, until);
        }
    }

    /// Bookkeeping for an EOSE or server-side CLOSED. Chat subscriptions
    /// are durable and never pass through here; check
    /// [`Self::is_chat_subscription`] first.
    pub fn on_subscription_closed(&mut self, subscription_id: &str) -> ClosedOutcome {
        let mut outcome = ClosedOutcome::default();

        for map in [
            &mut self.missing_metadata,
            &mut self.metadata_refresh,
            &mut self.bootstrap,
        ] {
            let (known, removed) = decrement(map, subscription_id);
            outcome.known |= known;
            outcome.fully_closed |= removed;
        }

        let (known, removed) = decrement(&mut self.activity_refresh, subscription_id);
        outcome.known |= known;
        outcome.fully_closed |= removed;
        // Metadata is bulk-fetched only after the activity backfill has
        // fully drained, bounding request fan-out.
        outcome.activity_refresh_drained = removed && self.activity_refresh.is_empty();

        outcome
    }

    pub fn is_chat_subscription(&self, subscription_id: &str) -> bool {
        self.chats
            .values()
            .any(|chat| chat.subscription_id == subscription_id)
    }

    /// Open (or refcount) the live-chat subscription for a coordinate.
    pub fn subscribe_chat(&mut self, pool: &RelayPool, coordinate: &str) -> Option<String> {
        if let Some(chat) = self.chats.get_mut(coordinate) {
            chat.refcount += 1;
            return Some(chat.subscription_id.clone());
        }
        let filter = FilterBuilder::new()
            .kinds([kinds::CHAT_MESSAGE])
            .coordinate(coordinate)
            .build()
            .expect("chat filter always has kinds");
        let subscription_id = pool.subscribe(&filter)?;
        self.chats.insert(
            coordinate.to_string(),
            ChatSubscription {
                subscription_id: subscription_id.clone(),
                filter,
                refcount: 1,
            },
        );
        Some(subscription_id)
    }

    /// Drop one reference to a coordinate's chat subscription. Returns the
    /// subscription id to CLOSE when the last reference went away.
    pub fn unsubscribe_chat(&mut self, coordinate: &str) -> Option<String> {
        let chat = self.chats.get_mut(coordinate)?;
        chat.refcount -= 1;
        if chat.refcount == 0 {
            let chat = self.chats.remove(coordinate).expect("present above");
            return Some(chat.subscription_id);
        }
        None
    }

    /// Durable chat subscriptions, for re-issue after a reconnect.
    pub fn chat_subscriptions(&self) -> impl Iterator<Item = &ChatSubscription> {
        self.chats.values()
    }

    pub fn outstanding_backfills(&self) -> usize {
        self.missing_metadata.len()
            + self.metadata_refresh.len()
            + self.bootstrap.len()
            + self.activity_refresh.len()
    }
}

enum WatermarkKind {
    Bootstrapped,
    PulledActivities,
}

/// Decrement a refcount map entry, removing it at zero.
/// Returns (entry was present, entry was removed).
fn decrement(map: &mut HashMap<String, usize>, id: &str) -> (bool, bool) {
    match map.get_mut(id) {
        None => (false, false),
        Some(count) if *count <= 1 => {
            map.remove(id);
            (true, true)
        }
        Some(count) => {
            *count -= 1;
            (true, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::mpsc;

    use crate::constants::kinds;
    use crate::models::Event;
    use crate::relay::connection::{ConnCommand, RelayPurpose, RelayState};
    use crate::relay::ClientMessage;
    use crate::store::MemoryEventStore;
    use crate::verify::AcceptAll;

    fn data_with_profile(pubkey: &str) -> DataStore {
        let mut data = DataStore::new(Box::new(MemoryEventStore::new()), Arc::new(AcceptAll));
        data.ingest(
            &Event {
                id: format!("profile-{pubkey}"),
                pubkey: pubkey.into(),
                kind: kinds::PROFILE,
                created_at: 1,
                tags: Vec::new(),
                content: r#"{"name":"known"}"#.into(),
                sig: String::new(),
            },
            None,
        );
        data
    }

    fn empty_data() -> DataStore {
        DataStore::new(Box::new(MemoryEventStore::new()), Arc::new(AcceptAll))
    }

    fn pool_with_relay() -> (RelayPool, mpsc::UnboundedReceiver<ConnCommand>) {
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let mut pool = RelayPool::new(notif_tx);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        pool.insert_test_relay("ws://a", RelayPurpose::Read, RelayState::Connected, cmd_tx);
        (pool, cmd_rx)
    }

    fn drain_reqs(rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> Vec<(String, Value)> {
        let mut reqs = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let ConnCommand::Send(ClientMessage::Req {
                subscription_id,
                filter,
            }) = command
            {
                reqs.push((subscription_id, serde_json::to_value(filter).unwrap()));
            }
        }
        reqs
    }

    #[test]
    fn missing_metadata_intent_is_not_duplicated() {
        let (pool, mut rx) = pool_with_relay();
        let data = empty_data();
        let mut manager = SubscriptionManager::new();

        let authors = vec!["a1".to_string(), "a2".to_string()];
        manager.pull_missing_and_refresh(&pool, &data, &authors, 100);
        let overlapping = vec!["a2".to_string(), "a3".to_string()];
        manager.pull_missing_and_refresh(&pool, &data, &overlapping, 101);

        let reqs = drain_reqs(&mut rx);
        assert_eq!(reqs.len(), 1, "second pull must not duplicate the intent");
        assert_eq!(manager.outstanding_backfills(), 1);
        assert!(reqs[0].1["since"].is_null());
        assert_eq!(reqs[0].1["until"], 100);
    }

    #[test]
    fn refresh_skipped_while_missing_fetch_outstanding() {
        let (pool, mut rx) = pool_with_relay();
        let data = data_with_profile("known1");
        let mut manager = SubscriptionManager::new();

        // First pull covers one unknown author: missing fetch goes out and
        // the refresh for the known author is suppressed.
        manager.pull_missing_and_refresh(
            &pool,
            &data,
            &["unknown1".to_string(), "known1".to_string()],
            100,
        );
        assert_eq!(drain_reqs(&mut rx).len(), 1);

        // Known-only pull while the fetch is still in flight: nothing.
        manager.pull_missing_and_refresh(&pool, &data, &["known1".to_string()], 101);
        assert!(drain_reqs(&mut rx).is_empty());

        // Drain the missing fetch; the next pull refreshes.
        let id = {
            let reqs = manager.missing_metadata.keys().cloned().collect::<Vec<_>>();
            reqs[0].clone()
        };
        manager.on_subscription_closed(&id);
        manager.pull_missing_and_refresh(&pool, &data, &["known1".to_string()], 102);
        let reqs = drain_reqs(&mut rx);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1["authors"][0], "known1");
    }

    #[test]
    fn metadata_refresh_since_comes_from_pool_minimum() {
        let (pool, mut rx) = pool_with_relay();
        let data = data_with_profile("known1");
        let mut manager = SubscriptionManager::new();
        manager
            .watermarks
            .last_pulled_from_follows
            .insert("ws://a".into(), 10);
        manager
            .watermarks
            .last_pulled_from_follows
            .insert("ws://b".into(), 5);

        manager.pull_missing_and_refresh(&pool, &data, &["known1".to_string()], 100);
        let reqs = drain_reqs(&mut rx);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1["since"], 6);
        // The connected relay's watermark advanced to the pull instant.
        assert_eq!(
            manager.watermarks.last_pulled_from_follows["ws://a"],
            100
        );
    }

    #[test]
    fn bootstrap_and_activity_refresh_fire_once() {
        let (pool, mut rx) = pool_with_relay();
        let mut data = empty_data();
        data.set_local_identity(Some("me".into()));
        let mut manager = SubscriptionManager::new();

        manager.refresh(&pool, &data, None, false, 100);
        let reqs = drain_reqs(&mut rx);
        assert_eq!(reqs.len(), 2);

        // Both intents outstanding: a second refresh is a no-op.
        manager.refresh(&pool, &data, None, false, 101);
        assert!(drain_reqs(&mut rx).is_empty());
        assert_eq!(manager.outstanding_backfills(), 2);

        assert_eq!(manager.watermarks.last_bootstrapped["ws://a"], 100);
        assert_eq!(manager.watermarks.last_pulled_activities["ws://a"], 100);
    }

    #[test]
    fn hard_refresh_ignores_watermarks() {
        let (pool, mut rx) = pool_with_relay();
        let mut data = empty_data();
        data.set_local_identity(Some("me".into()));
        let mut manager = SubscriptionManager::new();
        manager
            .watermarks
            .last_bootstrapped
            .insert("ws://a".into(), 50);
        manager
            .watermarks
            .last_pulled_activities
            .insert("ws://a".into(), 50);

        manager.refresh(&pool, &data, None, true, 100);
        for (_, filter) in drain_reqs(&mut rx) {
            assert!(filter["since"].is_null(), "hard refresh must re-pull history");
        }
    }

    #[test]
    fn incremental_refresh_uses_relay_watermark() {
        let (pool, mut rx) = pool_with_relay();
        let mut data = empty_data();
        data.set_local_identity(Some("me".into()));
        let mut manager = SubscriptionManager::new();
        manager
            .watermarks
            .last_bootstrapped
            .insert("ws://a".into(), 50);

        manager.refresh(&pool, &data, Some("ws://a"), false, 100);
        let reqs = drain_reqs(&mut rx);
        let bootstrap = reqs
            .iter()
            .find(|(_, f)| f["authors"][0] == "me")
            .expect("bootstrap request");
        assert_eq!(bootstrap.1["since"], 51);
    }

    #[test]
    fn activity_drain_triggers_bulk_metadata_signal() {
        let (pool, mut rx) = pool_with_relay();
        let data = empty_data();
        let mut manager = SubscriptionManager::new();

        manager.refresh(&pool, &data, None, false, 100);
        let reqs = drain_reqs(&mut rx);
        // No local identity: only the activity refresh fired.
        assert_eq!(reqs.len(), 1);
        let activity_sub = reqs[0].0.clone();

        let outcome = manager.on_subscription_closed(&activity_sub);
        assert!(outcome.known);
        assert!(outcome.fully_closed);
        assert!(outcome.activity_refresh_drained);

        let unknown = manager.on_subscription_closed("nope");
        assert_eq!(unknown, ClosedOutcome::default());
    }

    #[test]
    fn chat_subscriptions_are_refcounted() {
        let (pool, mut rx) = pool_with_relay();
        let mut manager = SubscriptionManager::new();
        let coord = "30311:ab:stream-1";

        let first = manager.subscribe_chat(&pool, coord).unwrap();
        let second = manager.subscribe_chat(&pool, coord).unwrap();
        assert_eq!(first, second);
        assert_eq!(drain_reqs(&mut rx).len(), 1, "one REQ for two viewers");
        assert!(manager.is_chat_subscription(&first));

        assert_eq!(manager.unsubscribe_chat(coord), None);
        assert_eq!(manager.unsubscribe_chat(coord), Some(first));
        assert!(manager.chat_subscriptions().next().is_none());
    }

    #[test]
    fn no_connected_relay_means_no_pull() {
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let mut pool = RelayPool::new(notif_tx);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        pool.insert_test_relay("ws://a", RelayPurpose::Read, RelayState::Connecting, cmd_tx);

        let mut manager = SubscriptionManager::new();
        let data = empty_data();
        manager.pull_missing_and_refresh(&pool, &data, &["a1".to_string()], 100);
        manager.refresh(&pool, &data, None, false, 100);
        assert!(drain_reqs(&mut cmd_rx).is_empty());
        assert_eq!(manager.outstanding_backfills(), 0);
    }
}

//! Authoritative reconciled state.
//!
//! Single source of truth for per-author and per-coordinate latest state,
//! deletion tombstones, the search tries, and the per-activity chat logs.
//! Mutated only by the owner loop; observers get read-only snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{
    ChatMessage, Deletion, Event, EventPayload, FollowList, LiveActivity, Profile,
};
use crate::store::records::{EventStore, PersistedRecord};
use crate::trie::{fold_key, InsertOptions, Trie};
use crate::verify::EventVerifier;

/// What an ingested event changed, so the owner loop can notify observers
/// and fire follow-up pulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEffect {
    ProfileUpdated {
        pubkey: String,
    },
    FollowListUpdated {
        pubkey: String,
        followed: Vec<String>,
        is_local: bool,
    },
    ActivityUpdated {
        coordinate: String,
    },
    ChatMessageAdded {
        message: ChatMessage,
    },
    Deleted {
        event_ids: Vec<String>,
        coordinates: Vec<String>,
    },
    /// Record-cache bookkeeping only: duplicate id, stale replaceable,
    /// or unknown kind.
    CachedOnly,
}

pub struct DataStore {
    store: Box<dyn EventStore>,
    verifier: Arc<dyn EventVerifier>,

    pub profiles: HashMap<String, Profile>, // pubkey -> latest profile
    pub follow_lists: HashMap<String, FollowList>, // pubkey -> latest list
    pub activities: HashMap<String, LiveActivity>, // coordinate -> latest
    chat_logs: HashMap<String, Vec<ChatMessage>>, // coordinate -> ordered log
    chat_message_ids: HashMap<String, HashSet<String>>,

    pub deleted_event_ids: HashSet<String>,
    pub deleted_coordinates: HashMap<String, u64>, // coordinate -> deletion ts

    profile_trie: Trie<String>,  // search keys -> pubkey
    activity_trie: Trie<String>, // search keys -> coordinate

    local_pubkey: Option<String>,
    pub followed_pubkeys: HashSet<String>,

    /// Events whose persist failed; retried on the next publish sweep.
    unpersisted: Vec<(Event, Vec<String>)>,
}

impl DataStore {
    pub fn new(store: Box<dyn EventStore>, verifier: Arc<dyn EventVerifier>) -> Self {
        DataStore {
            store,
            verifier,
            profiles: HashMap::new(),
            follow_lists: HashMap::new(),
            activities: HashMap::new(),
            chat_logs: HashMap::new(),
            chat_message_ids: HashMap::new(),
            deleted_event_ids: HashSet::new(),
            deleted_coordinates: HashMap::new(),
            profile_trie: Trie::new(),
            activity_trie: Trie::new(),
            local_pubkey: None,
            followed_pubkeys: HashSet::new(),
            unpersisted: Vec::new(),
        }
    }

    pub fn set_local_identity(&mut self, pubkey: Option<String>) {
        self.local_pubkey = pubkey;
        self.refresh_followed_pubkeys();
    }

    pub fn local_pubkey(&self) -> Option<&str> {
        self.local_pubkey.as_deref()
    }

    /// Recompute the followed-keys set: the local key plus everything its
    /// latest follow list references.
    fn refresh_followed_pubkeys(&mut self) {
        self.followed_pubkeys.clear();
        if let Some(local) = self.local_pubkey.clone() {
            self.followed_pubkeys.insert(local.clone());
            if let Some(list) = self.follow_lists.get(&local) {
                self.followed_pubkeys.extend(list.followed.iter().cloned());
            }
        }
    }

    /// Ingest one event from the network (or locally when `relay` is None).
    ///
    /// Returns None when the event is dropped without trace: failed
    /// verification, or a tombstoned id arriving again.
    pub fn ingest(&mut self, event: &Event, relay: Option<&str>) -> Option<IngestEffect> {
        if !self.verifier.verify(event) {
            return None;
        }
        if self.deleted_event_ids.contains(&event.id) {
            tracing::debug!(id = %event.id, "dropping tombstoned event id");
            return None;
        }

        // A duplicate id only grows the record's seen-relay set; entity
        // state never changes for it.
        if self.store.lookup(&event.id).is_some() {
            if let Some(relay) = relay {
                self.store.mark_seen(&event.id, relay);
            }
            return Some(IngestEffect::CachedOnly);
        }

        let seen_on: Vec<String> = relay.map(str::to_string).into_iter().collect();
        if let Err(error) = self.store.persist(event, &seen_on) {
            tracing::warn!(id = %event.id, %error, "failed to persist event, treating as unpublished");
            self.unpersisted.push((event.clone(), seen_on));
        }

        Some(self.apply_payload(event))
    }

    /// Confirmation that a relay accepted a published event.
    pub fn mark_published(&mut self, event_id: &str, relay: &str) -> bool {
        self.store.mark_seen(event_id, relay)
    }

    pub fn unpublished_events(&self) -> Vec<Event> {
        self.store
            .list_unpublished()
            .into_iter()
            .map(|record| record.event)
            .collect()
    }

    /// Retry persisting anything a previous sweep failed to write.
    pub fn retry_unpersisted(&mut self) {
        let pending = std::mem::take(&mut self.unpersisted);
        for (event, seen_on) in pending {
            if let Err(error) = self.store.persist(&event, &seen_on) {
                tracing::warn!(id = %event.id, %error, "persist retry failed");
                self.unpersisted.push((event, seen_on));
            }
        }
    }

    /// Replay every persisted record through the entity maps, oldest first,
    /// without touching the record cache. Used at startup.
    pub fn load_persisted(&mut self) -> usize {
        let mut records: Vec<PersistedRecord> = self.store.list_all();
        records.sort_by_key(|record| record.event.created_at);
        let count = records.len();
        for record in records {
            self.apply_payload(&record.event);
        }
        count
    }

    fn apply_payload(&mut self, event: &Event) -> IngestEffect {
        match EventPayload::decode(event) {
            EventPayload::Profile(profile) => self.apply_profile(profile),
            EventPayload::FollowList(list) => self.apply_follow_list(list),
            EventPayload::LiveActivity(activity) => self.apply_activity(activity),
            EventPayload::ChatMessage(message) => self.apply_chat_message(message),
            EventPayload::Deletion(deletion) => self.apply_deletion(&deletion),
            EventPayload::Unknown => IngestEffect::CachedOnly,
        }
    }

    fn apply_profile(&mut self, profile: Profile) -> IngestEffect {
        if let Some(existing) = self.profiles.get(&profile.pubkey) {
            if existing.created_at >= profile.created_at {
                return IngestEffect::CachedOnly;
            }
            // Drop index entries for fields whose value actually changed;
            // identical spellings stay in place.
            if let Some(old_name) = existing.name() {
                if existing.name() != profile.name() {
                    self.profile_trie.remove(old_name, &profile.pubkey);
                }
            }
            if let Some(old_display) = existing.display_name() {
                if existing.display_name() != profile.display_name() {
                    self.profile_trie.remove(old_display, &profile.pubkey);
                }
            }
        }

        if let Some(name) = profile.name() {
            self.profile_trie
                .insert(name, profile.pubkey.clone(), InsertOptions::loose_substring());
        }
        if let Some(display_name) = profile.display_name() {
            self.profile_trie.insert(
                display_name,
                profile.pubkey.clone(),
                InsertOptions::loose_substring(),
            );
        }
        // The author key itself is always searchable.
        let pubkey_key = profile.pubkey.clone();
        self.profile_trie
            .insert(&pubkey_key, pubkey_key.clone(), InsertOptions::exact_substring());

        let pubkey = profile.pubkey.clone();
        self.profiles.insert(pubkey.clone(), profile);
        IngestEffect::ProfileUpdated { pubkey }
    }

    fn apply_follow_list(&mut self, list: FollowList) -> IngestEffect {
        if let Some(existing) = self.follow_lists.get(&list.pubkey) {
            if existing.created_at >= list.created_at {
                return IngestEffect::CachedOnly;
            }
        }
        let pubkey = list.pubkey.clone();
        let followed = list.followed.clone();
        self.follow_lists.insert(pubkey.clone(), list);

        let is_local = self.local_pubkey.as_deref() == Some(pubkey.as_str());
        if is_local {
            self.refresh_followed_pubkeys();
        }
        IngestEffect::FollowListUpdated {
            pubkey,
            followed,
            is_local,
        }
    }

    fn apply_activity(&mut self, activity: LiveActivity) -> IngestEffect {
        let coordinate = activity.coordinate.to_string();

        if let Some(&deleted_at) = self.deleted_coordinates.get(&coordinate) {
            if deleted_at >= activity.created_at {
                tracing::debug!(%coordinate, "dropping activity for tombstoned coordinate");
                return IngestEffect::CachedOnly;
            }
        }

        if let Some(existing) = self.activities.get(&coordinate) {
            if existing.created_at >= activity.created_at {
                return IngestEffect::CachedOnly;
            }
            let old = existing.clone();
            self.remove_activity_index_entries(&old, changed_fields(&old, &activity));
        }

        self.insert_activity_index_entries(&activity);
        self.activities.insert(coordinate.clone(), activity);
        IngestEffect::ActivityUpdated { coordinate }
    }

    fn apply_chat_message(&mut self, message: ChatMessage) -> IngestEffect {
        let coordinate = message.activity.to_string();
        let ids = self.chat_message_ids.entry(coordinate.clone()).or_default();
        if !ids.insert(message.id.clone()) {
            return IngestEffect::CachedOnly;
        }

        let log = self.chat_logs.entry(coordinate).or_default();
        // Insert after every entry at the same timestamp so first-seen
        // order is preserved on ties.
        let at = log.partition_point(|m| m.created_at <= message.created_at);
        log.insert(at, message.clone());
        IngestEffect::ChatMessageAdded { message }
    }

    fn apply_deletion(&mut self, deletion: &Deletion) -> IngestEffect {
        let mut removed_ids = Vec::new();
        let mut removed_coordinates = Vec::new();

        // Pass one: coordinates. Only the coordinate's own author may
        // tombstone it.
        for coordinate in &deletion.coordinates {
            if coordinate.pubkey != deletion.pubkey {
                continue;
            }
            let key = coordinate.to_string();
            if let Some(&existing) = self.deleted_coordinates.get(&key) {
                if existing >= deletion.created_at {
                    continue;
                }
            }
            self.deleted_coordinates.insert(key.clone(), deletion.created_at);

            let removable = self
                .activities
                .get(&key)
                .is_some_and(|activity| activity.created_at <= deletion.created_at);
            if removable {
                if let Some(activity) = self.activities.remove(&key) {
                    self.remove_activity_index_entries(&activity, ChangedFields::all());
                    removed_coordinates.push(key);
                }
            }
        }

        // Pass two: event ids. The cached record tells us the declared
        // author; ids we never cached cannot be author-verified and are
        // skipped.
        for event_id in &deletion.event_ids {
            let Some(record) = self.store.lookup(event_id) else {
                continue;
            };
            if record.event.pubkey != deletion.pubkey {
                continue;
            }

            match EventPayload::decode(&record.event) {
                EventPayload::Profile(_) => {
                    if let Some(profile) = self.profiles.remove(&record.event.pubkey) {
                        self.remove_profile_index_entries(&profile);
                    }
                }
                EventPayload::FollowList(_) => {
                    self.follow_lists.remove(&record.event.pubkey);
                    if self.local_pubkey.as_deref() == Some(record.event.pubkey.as_str()) {
                        self.refresh_followed_pubkeys();
                    }
                }
                EventPayload::LiveActivity(activity) => {
                    let key = activity.coordinate.to_string();
                    if self
                        .activities
                        .get(&key)
                        .is_some_and(|cached| cached.event_id == *event_id)
                    {
                        let cached = self.activities.remove(&key).expect("checked above");
                        self.remove_activity_index_entries(&cached, ChangedFields::all());
                        removed_coordinates.push(key);
                    }
                }
                EventPayload::ChatMessage(message) => {
                    let key = message.activity.to_string();
                    if let Some(log) = self.chat_logs.get_mut(&key) {
                        log.retain(|m| m.id != *event_id);
                    }
                    if let Some(ids) = self.chat_message_ids.get_mut(&key) {
                        ids.remove(event_id);
                    }
                }
                EventPayload::Deletion(_) | EventPayload::Unknown => continue,
            }

            self.deleted_event_ids.insert(event_id.clone());
            self.store.remove(event_id);
            removed_ids.push(event_id.clone());
        }

        IngestEffect::Deleted {
            event_ids: removed_ids,
            coordinates: removed_coordinates,
        }
    }

    fn remove_profile_index_entries(&mut self, profile: &Profile) {
        if let Some(name) = profile.name() {
            self.profile_trie.remove(name, &profile.pubkey);
        }
        if let Some(display_name) = profile.display_name() {
            self.profile_trie.remove(display_name, &profile.pubkey);
        }
        self.profile_trie.remove(&profile.pubkey, &profile.pubkey);
    }

    fn insert_activity_index_entries(&mut self, activity: &LiveActivity) {
        let coordinate = activity.coordinate.to_string();
        self.activity_trie
            .insert(&activity.event_id, coordinate.clone(), InsertOptions::exact());
        self.activity_trie
            .insert(&activity.pubkey, coordinate.clone(), InsertOptions::exact());
        if !activity.identifier.is_empty() {
            self.activity_trie.insert(
                &activity.identifier,
                coordinate.clone(),
                InsertOptions::exact(),
            );
        }
        if let Some(title) = activity.title() {
            self.activity_trie
                .insert(title, coordinate.clone(), InsertOptions::loose_substring());
        }
        if let Some(summary) = activity.summary() {
            self.activity_trie
                .insert(summary, coordinate.clone(), InsertOptions::loose_substring());
        }
    }

    fn remove_activity_index_entries(&mut self, activity: &LiveActivity, changed: ChangedFields) {
        let coordinate = activity.coordinate.to_string();
        // The replaced event's id never carries over.
        self.activity_trie.remove(&activity.event_id, &coordinate);
        if changed.everything {
            self.activity_trie.remove(&activity.pubkey, &coordinate);
            if !activity.identifier.is_empty() {
                self.activity_trie.remove(&activity.identifier, &coordinate);
            }
        }
        if changed.title || changed.everything {
            if let Some(title) = activity.title() {
                self.activity_trie.remove(title, &coordinate);
            }
        }
        if changed.summary || changed.everything {
            if let Some(summary) = activity.summary() {
                self.activity_trie.remove(summary, &coordinate);
            }
        }
    }

    /// Search cached profiles; returns matches sorted by pubkey for
    /// deterministic presentation.
    pub fn search_profiles(&self, query: &str) -> Vec<&Profile> {
        let mut keys: Vec<String> = self.profile_trie.find(&fold_key(query)).into_iter().collect();
        keys.sort();
        keys.iter().filter_map(|k| self.profiles.get(k)).collect()
    }

    /// Search cached activities by id, author, identifier, title, summary.
    pub fn search_activities(&self, query: &str) -> Vec<&LiveActivity> {
        let mut keys: Vec<String> = self.activity_trie.find(&fold_key(query)).into_iter().collect();
        keys.sort();
        keys.iter().filter_map(|k| self.activities.get(k)).collect()
    }

    /// Activities whose schedule has not fully passed, soonest first.
    pub fn upcoming_activities(&self, now: u64) -> Vec<&LiveActivity> {
        let mut list: Vec<&LiveActivity> = self
            .activities
            .values()
            .filter(|a| a.is_upcoming(now))
            .collect();
        list.sort_by_key(|a| a.starts_at.unwrap_or(u64::MAX));
        list
    }

    /// Finished activities, most recent first.
    pub fn past_activities(&self, now: u64) -> Vec<&LiveActivity> {
        let mut list: Vec<&LiveActivity> = self
            .activities
            .values()
            .filter(|a| a.is_past(now))
            .collect();
        list.sort_by_key(|a| std::cmp::Reverse(a.starts_at.unwrap_or(0)));
        list
    }

    /// Full ordered chat log for an activity coordinate.
    pub fn chat_log(&self, coordinate: &str) -> &[ChatMessage] {
        self.chat_logs
            .get(coordinate)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_profile(&self, pubkey: &str) -> bool {
        self.profiles.contains_key(pubkey)
    }

    /// Authors of every cached activity, deduplicated.
    pub fn activity_authors(&self) -> Vec<String> {
        let set: HashSet<&str> = self
            .activities
            .values()
            .map(|a| a.pubkey.as_str())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }
}

/// Which searchable fields differ between the cached and incoming copy of
/// an activity. Unchanged fields keep their index entries.
struct ChangedFields {
    title: bool,
    summary: bool,
    everything: bool,
}

impl ChangedFields {
    fn all() -> Self {
        ChangedFields {
            title: true,
            summary: true,
            everything: true,
        }
    }
}

fn changed_fields(existing: &LiveActivity, incoming: &LiveActivity) -> ChangedFields {
    ChangedFields {
        title: existing.title() != incoming.title(),
        summary: existing.summary() != incoming.summary(),
        everything: false,
    }
}

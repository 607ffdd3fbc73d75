//! Wire event model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::constants::kinds;
use crate::models::{ChatMessage, FollowList, LiveActivity, Profile};

/// A single event tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. Common examples:
///
/// - `p` – references another author's public key
/// - `e` – links to another event id
/// - `a` – links to a replaceable-event coordinate
/// - `d` – unique identifier for replaceable events
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag type, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Primary tag value, i.e. the second element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed network event as it travels on the wire.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "bb22...",
///   "kind": 30311,
///   "created_at": 1700000000,
///   "tags": [["d", "stream-1"], ["title", "opening night"]],
///   "content": "",
///   "sig": "deadbeef"
/// }
/// ```
///
/// Immutable once constructed; the reconciliation engine never rewrites a
/// cached event, it only replaces whole records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier (hex of the SHA-256 content hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number selecting the payload variant.
    pub kind: u16,
    /// Unix timestamp of creation, in seconds.
    pub created_at: u64,
    /// Ordered tag list.
    pub tags: Vec<Tag>,
    /// Content body.
    pub content: String,
    /// Signature over the event hash (hex). Verified by an external
    /// collaborator, never inspected here.
    pub sig: String,
}

impl Event {
    /// First value of the first tag with the given name.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values of tags with the given name, in tag order.
    pub fn tag_values<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some(name))
            .filter_map(Tag::value)
            .collect()
    }

    /// The `d` tag identifier of a parameterized replaceable event.
    pub fn identifier(&self) -> Option<&str> {
        self.first_tag_value("d")
    }

    /// Replaceable-event coordinate for this event, if its kind is
    /// parameterized replaceable.
    pub fn coordinate(&self) -> Option<Coordinate> {
        if self.kind != kinds::LIVE_ACTIVITY {
            return None;
        }
        Some(Coordinate {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            identifier: self.identifier().unwrap_or_default().to_string(),
        })
    }

    /// Canonical content-hash id over `[0, pubkey, created_at, kind, tags,
    /// content]`, hex encoded.
    pub fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u16,
        tags: &[Tag],
        content: &str,
    ) -> String {
        let canonical = json!([0, pubkey, created_at, kind, tags, content]);
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Coordinate identifying the slot a parameterized replaceable event
/// occupies. Only one event is authoritative per coordinate at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub kind: u16,
    pub pubkey: String,
    pub identifier: String,
}

impl Coordinate {
    /// Parse the `kind:pubkey:identifier` string form used in `a` tags.
    /// The identifier may itself contain colons.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?.to_string();
        let identifier = parts.next().unwrap_or_default().to_string();
        if pubkey.is_empty() {
            return None;
        }
        Some(Coordinate {
            kind,
            pubkey,
            identifier,
        })
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

/// Deletion request payload: the ids and coordinates the author asks to
/// retract. Only targets actually authored by the same key are honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub pubkey: String,
    pub created_at: u64,
    pub event_ids: Vec<String>,
    pub coordinates: Vec<Coordinate>,
}

impl Deletion {
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kinds::DELETION {
            return None;
        }
        Some(Deletion {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            event_ids: event
                .tag_values("e")
                .into_iter()
                .map(str::to_string)
                .collect(),
            coordinates: event
                .tag_values("a")
                .into_iter()
                .filter_map(Coordinate::parse)
                .collect(),
        })
    }
}

/// Closed set of payload variants, decoded once at the boundary.
///
/// Kinds outside the known set land in `Unknown`; they still participate in
/// record-cache bookkeeping but never touch entity maps or indices.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Profile(Profile),
    FollowList(FollowList),
    LiveActivity(LiveActivity),
    Deletion(Deletion),
    ChatMessage(ChatMessage),
    Unknown,
}

impl EventPayload {
    pub fn decode(event: &Event) -> Self {
        match event.kind {
            kinds::PROFILE => Profile::from_event(event)
                .map(EventPayload::Profile)
                .unwrap_or(EventPayload::Unknown),
            kinds::FOLLOW_LIST => FollowList::from_event(event)
                .map(EventPayload::FollowList)
                .unwrap_or(EventPayload::Unknown),
            kinds::LIVE_ACTIVITY => LiveActivity::from_event(event)
                .map(EventPayload::LiveActivity)
                .unwrap_or(EventPayload::Unknown),
            kinds::DELETION => Deletion::from_event(event)
                .map(EventPayload::Deletion)
                .unwrap_or(EventPayload::Unknown),
            kinds::CHAT_MESSAGE => ChatMessage::from_event(event)
                .map(EventPayload::ChatMessage)
                .unwrap_or(EventPayload::Unknown),
            _ => EventPayload::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_round_trip() {
        let coord = Coordinate {
            kind: 30311,
            pubkey: "ab".into(),
            identifier: "stream-1".into(),
        };
        let s = coord.to_string();
        assert_eq!(s, "30311:ab:stream-1");
        assert_eq!(Coordinate::parse(&s), Some(coord));
    }

    #[test]
    fn coordinate_identifier_may_contain_colons() {
        let coord = Coordinate::parse("30311:ab:a:b:c").unwrap();
        assert_eq!(coord.identifier, "a:b:c");
    }

    #[test]
    fn coordinate_rejects_garbage() {
        assert_eq!(Coordinate::parse("not-a-kind:ab:x"), None);
        assert_eq!(Coordinate::parse("30311"), None);
    }

    #[test]
    fn compute_id_is_stable() {
        let tags = vec![Tag::new(["d", "s"])];
        let a = Event::compute_id("ab", 10, 30311, &tags, "hello");
        let b = Event::compute_id("ab", 10, 30311, &tags, "hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = Event::compute_id("ab", 11, 30311, &tags, "hello");
        assert_ne!(a, c);
    }
}

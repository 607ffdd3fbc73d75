use serde::Deserialize;

use crate::constants::kinds;
use crate::models::Event;

/// JSON body of a profile event's content field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileContent {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
}

/// Latest known profile for an author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub pubkey: String,
    pub event_id: String,
    pub created_at: u64,
    pub content: ProfileContent,
}

impl Profile {
    /// Decode a kind:0 event. Unparseable content yields an empty profile
    /// body rather than dropping the event; the record still participates
    /// in last-write-wins so a later good profile can replace it.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kinds::PROFILE {
            return None;
        }
        let content = serde_json::from_str(&event.content).unwrap_or_default();
        Some(Profile {
            pubkey: event.pubkey.clone(),
            event_id: event.id.clone(),
            created_at: event.created_at,
            content,
        })
    }

    /// Searchable name, trimmed; None when absent or blank.
    pub fn name(&self) -> Option<&str> {
        trimmed_or_none(self.content.name.as_deref())
    }

    /// Searchable display name, trimmed; None when absent or blank.
    pub fn display_name(&self) -> Option<&str> {
        trimmed_or_none(self.content.display_name.as_deref())
    }
}

pub(crate) fn trimmed_or_none(value: Option<&str>) -> Option<&str> {
    match value.map(str::trim) {
        Some("") | None => None,
        Some(v) => Some(v),
    }
}

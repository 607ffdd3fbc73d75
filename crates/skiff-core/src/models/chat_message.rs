use crate::constants::kinds;
use crate::models::{Coordinate, Event};

/// One live-chat message, attached to an activity coordinate by its `a` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub content: String,
    /// Coordinate of the activity this message belongs to.
    pub activity: Coordinate,
}

impl ChatMessage {
    /// Decode a kind:1311 event. Messages without a parseable activity
    /// coordinate have nowhere to land and are rejected.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kinds::CHAT_MESSAGE {
            return None;
        }
        let activity = event.first_tag_value("a").and_then(Coordinate::parse)?;
        Some(ChatMessage {
            id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            content: event.content.clone(),
            activity,
        })
    }
}

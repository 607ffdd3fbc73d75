use crate::constants::kinds;
use crate::models::profile::trimmed_or_none;
use crate::models::{Coordinate, Event};

/// Latest known live activity for a coordinate.
///
/// The searchable fields (title, summary, identifier) are read from tags at
/// decode time so index maintenance never has to re-walk the raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveActivity {
    pub coordinate: Coordinate,
    pub event_id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub identifier: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    /// Scheduled start, unix seconds ("starts" tag).
    pub starts_at: Option<u64>,
    /// Scheduled end, unix seconds ("ends" tag).
    pub ends_at: Option<u64>,
}

impl LiveActivity {
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kinds::LIVE_ACTIVITY {
            return None;
        }
        let coordinate = event.coordinate()?;
        Some(LiveActivity {
            identifier: coordinate.identifier.clone(),
            coordinate,
            event_id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            title: owned_trimmed(event.first_tag_value("title")),
            summary: owned_trimmed(event.first_tag_value("summary")),
            image: owned_trimmed(event.first_tag_value("image")),
            starts_at: event.first_tag_value("starts").and_then(|v| v.parse().ok()),
            ends_at: event.first_tag_value("ends").and_then(|v| v.parse().ok()),
        })
    }

    /// Trimmed title; None when absent or blank.
    pub fn title(&self) -> Option<&str> {
        trimmed_or_none(self.title.as_deref())
    }

    /// Trimmed summary; None when absent or blank.
    pub fn summary(&self) -> Option<&str> {
        trimmed_or_none(self.summary.as_deref())
    }

    /// An activity is upcoming while its schedule has not fully passed.
    /// Without an end time, the start alone decides.
    pub fn is_upcoming(&self, now: u64) -> bool {
        let Some(starts_at) = self.starts_at else {
            return false;
        };
        match self.ends_at {
            Some(ends_at) => starts_at >= now || ends_at >= now,
            None => starts_at >= now,
        }
    }

    pub fn is_past(&self, now: u64) -> bool {
        let Some(starts_at) = self.starts_at else {
            return false;
        };
        match self.ends_at {
            Some(ends_at) => ends_at < now,
            None => starts_at < now,
        }
    }
}

fn owned_trimmed(value: Option<&str>) -> Option<String> {
    trimmed_or_none(value).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tag;

    fn activity_event() -> Event {
        Event {
            id: "e1".into(),
            pubkey: "ab".into(),
            kind: kinds::LIVE_ACTIVITY,
            created_at: 10,
            tags: vec![
                Tag::new(["d", "stream-1"]),
                Tag::new(["title", " Opening Night "]),
                Tag::new(["summary", "a premiere"]),
                Tag::new(["starts", "100"]),
                Tag::new(["ends", "200"]),
            ],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn decodes_tagged_fields() {
        let activity = LiveActivity::from_event(&activity_event()).unwrap();
        assert_eq!(activity.coordinate.to_string(), "30311:ab:stream-1");
        assert_eq!(activity.title(), Some("Opening Night"));
        assert_eq!(activity.summary(), Some("a premiere"));
        assert_eq!(activity.starts_at, Some(100));
        assert_eq!(activity.ends_at, Some(200));
    }

    #[test]
    fn upcoming_and_past_partitions() {
        let activity = LiveActivity::from_event(&activity_event()).unwrap();
        assert!(activity.is_upcoming(50));
        assert!(activity.is_upcoming(150)); // still running
        assert!(!activity.is_upcoming(250));
        assert!(activity.is_past(250));
        assert!(!activity.is_past(150));
    }

    #[test]
    fn unscheduled_activity_is_neither() {
        let mut event = activity_event();
        event.tags.retain(|t| t.name() != Some("starts") && t.name() != Some("ends"));
        let activity = LiveActivity::from_event(&event).unwrap();
        assert!(!activity.is_upcoming(50));
        assert!(!activity.is_past(50));
    }
}

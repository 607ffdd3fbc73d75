use crate::constants::kinds;
use crate::models::Event;

/// Latest known follow list for an author (p-tagged public keys, in tag
/// order, duplicates preserved as published).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowList {
    pub pubkey: String,
    pub event_id: String,
    pub created_at: u64,
    pub followed: Vec<String>,
}

impl FollowList {
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kinds::FOLLOW_LIST {
            return None;
        }
        Some(FollowList {
            pubkey: event.pubkey.clone(),
            event_id: event.id.clone(),
            created_at: event.created_at,
            followed: event
                .tag_values("p")
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tag;

    #[test]
    fn collects_p_tags_in_order() {
        let event = Event {
            id: "e1".into(),
            pubkey: "ab".into(),
            kind: kinds::FOLLOW_LIST,
            created_at: 10,
            tags: vec![
                Tag::new(["p", "cd"]),
                Tag::new(["e", "ignored"]),
                Tag::new(["p", "ef"]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let list = FollowList::from_event(&event).unwrap();
        assert_eq!(list.followed, vec!["cd", "ef"]);
    }
}

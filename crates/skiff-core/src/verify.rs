//! Pluggable event validity check.
//!
//! Signature cryptography lives outside the engine; embeddings supply an
//! implementation and the engine treats a `false` verdict as "drop
//! silently, keep no trace."

use crate::models::Event;

pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

/// Accepts every event. Useful in tests and for embeddings that verify
/// upstream of the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl EventVerifier for AcceptAll {
    fn verify(&self, _event: &Event) -> bool {
        true
    }
}

/// Checks that the event id equals the canonical content hash. Catches
/// tampered or miscomputed ids without doing any signature work.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdHashVerifier;

impl EventVerifier for IdHashVerifier {
    fn verify(&self, event: &Event) -> bool {
        event.id
            == Event::compute_id(
                &event.pubkey,
                event.created_at,
                event.kind,
                &event.tags,
                &event.content,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::kinds;
    use crate::models::Tag;

    #[test]
    fn id_hash_verifier_accepts_canonical_ids() {
        let tags = vec![Tag::new(["d", "s"])];
        let event = Event {
            id: Event::compute_id("ab", 10, kinds::LIVE_ACTIVITY, &tags, "x"),
            pubkey: "ab".into(),
            kind: kinds::LIVE_ACTIVITY,
            created_at: 10,
            tags,
            content: "x".into(),
            sig: String::new(),
        };
        assert!(IdHashVerifier.verify(&event));

        let mut tampered = event.clone();
        tampered.content = "y".into();
        assert!(!IdHashVerifier.verify(&tampered));
    }
}

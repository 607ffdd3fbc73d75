//! Chat timeline windowing.
//!
//! Presents a bounded, contiguous window over an activity's full reconciled
//! chat log while the log keeps growing underneath it, possibly with
//! late-arriving out-of-order entries. The window never shows a duplicate
//! id, and ties on timestamp keep their first-seen relative order.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::models::ChatMessage;

pub struct ChatTimeline {
    page_size: usize,
    visible: Vec<ChatMessage>,
    has_older: bool,
    loading: bool,
}

impl ChatTimeline {
    pub fn new(page_size: usize) -> Self {
        ChatTimeline {
            page_size: page_size.max(1),
            visible: Vec::new(),
            has_older: false,
            loading: false,
        }
    }

    /// Visible window, ascending by timestamp.
    pub fn visible(&self) -> &[ChatMessage] {
        &self.visible
    }

    /// Whether older entries exist beyond the top of the window.
    pub fn has_older(&self) -> bool {
        self.has_older
    }

    /// Single-flight guard: claims the in-progress slot, failing when a
    /// load or backfill is already running for this window.
    pub fn begin_load(&mut self) -> bool {
        if self.loading {
            return false;
        }
        self.loading = true;
        true
    }

    pub fn finish_load(&mut self) {
        self.loading = false;
    }

    /// Fill the window with the most recent page of the full log.
    pub fn load_initial(&mut self, log: &[ChatMessage]) {
        let start = log.len().saturating_sub(self.page_size);
        self.visible = log[start..].to_vec();
        self.has_older = start > 0;
    }

    /// Absorb a new snapshot of the full log, growing the tail of the
    /// window. A snapshot whose new entries are all in timestamp order is a
    /// straight append; otherwise the visible tail is re-merged with the
    /// snapshot tail, deduplicating by id and keeping the earlier-seen copy.
    pub fn apply_snapshot(&mut self, log: &[ChatMessage]) {
        let Some(last_visible) = self.visible.last() else {
            self.load_initial(log);
            return;
        };

        let Some(anchor) = log.iter().position(|m| m.id == last_visible.id) else {
            // The anchor entry disappeared (deleted). Rebuild the window at
            // its current size from the snapshot tail.
            let window = self.visible.len().max(self.page_size);
            let start = log.len().saturating_sub(window);
            self.visible = log[start..].to_vec();
            self.has_older = start > 0;
            return;
        };

        let tail = &log[anchor + 1..];
        if tail.is_empty() {
            return;
        }

        if tail[0].created_at >= last_visible.created_at {
            let seen: HashSet<&str> = self.visible.iter().map(|m| m.id.as_str()).collect();
            let fresh: Vec<ChatMessage> = tail
                .iter()
                .filter(|m| !seen.contains(m.id.as_str()))
                .cloned()
                .collect();
            self.visible.extend(fresh);
        } else {
            self.visible = merge_by_timestamp(&self.visible, tail);
        }
    }

    /// Prepend up to one page of entries older than the oldest visible one.
    /// Call when the consumer reaches the top of the window.
    pub fn load_older(&mut self, log: &[ChatMessage]) {
        let Some(oldest) = self.visible.first() else {
            self.load_initial(log);
            return;
        };
        let Some(index) = log.iter().position(|m| m.id == oldest.id) else {
            return;
        };
        let start = index.saturating_sub(self.page_size);
        let mut prefix = log[start..index].to_vec();
        let seen: HashSet<&str> = self.visible.iter().map(|m| m.id.as_str()).collect();
        prefix.retain(|m| !seen.contains(m.id.as_str()));
        prefix.extend(self.visible.drain(..));
        self.visible = prefix;
        self.has_older = start > 0;
    }
}

/// Two-pointer merge by timestamp, deduplicating by id. When both sides
/// carry the same id, the left (earlier-seen) copy wins; on equal
/// timestamps left entries come first.
fn merge_by_timestamp(left: &[ChatMessage], right: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut l = 0;
    let mut r = 0;
    while l < left.len() || r < right.len() {
        let take_left = match (left.get(l), right.get(r)) {
            (Some(a), Some(b)) => a.created_at <= b.created_at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let candidate = if take_left {
            l += 1;
            &left[l - 1]
        } else {
            r += 1;
            &right[r - 1]
        };
        if seen.insert(candidate.id.clone()) {
            out.push(candidate.clone());
        }
    }
    out
}

/// Coalesces bursts of profile-pull triggers into one pull listing the
/// union of requested authors. The pending set is drained only when the
/// pull fires; a newer trigger resets the quiescence timer.
pub struct MetadataDebouncer {
    pending: HashSet<String>,
    deadline: Option<Instant>,
    window: Duration,
}

impl MetadataDebouncer {
    pub fn new(window: Duration) -> Self {
        MetadataDebouncer {
            pending: HashSet::new(),
            deadline: None,
            window,
        }
    }

    pub fn request<I, S>(&mut self, authors: I, now: Instant)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut any = false;
        for author in authors {
            self.pending.insert(author.into());
            any = true;
        }
        // Every trigger replaces the timer, even when it adds nothing new.
        if any {
            self.deadline = Some(now + self.window);
        }
    }

    /// The instant the pending pull becomes due, if one is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            self.deadline
        }
    }

    /// Drain and return the pending authors once the quiescence window has
    /// elapsed; None while the window is still open or nothing is pending.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<String>> {
        let deadline = self.deadline?;
        if now < deadline || self.pending.is_empty() {
            return None;
        }
        self.deadline = None;
        let mut authors: Vec<String> = self.pending.drain().collect();
        authors.sort();
        Some(authors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinate;

    fn message(id: &str, created_at: u64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            pubkey: "cd".into(),
            created_at,
            content: format!("msg {id}"),
            activity: Coordinate {
                kind: 30311,
                pubkey: "ab".into(),
                identifier: "s".into(),
            },
        }
    }

    fn ids(timeline: &ChatTimeline) -> Vec<&str> {
        timeline.visible().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn initial_load_takes_most_recent_page() {
        let log: Vec<ChatMessage> = (0..7).map(|i| message(&format!("m{i}"), i)).collect();
        let mut timeline = ChatTimeline::new(3);
        timeline.load_initial(&log);
        assert_eq!(ids(&timeline), vec!["m4", "m5", "m6"]);
        assert!(timeline.has_older());

        let mut small = ChatTimeline::new(10);
        small.load_initial(&log);
        assert_eq!(small.visible().len(), 7);
        assert!(!small.has_older());
    }

    #[test]
    fn in_order_tail_growth_appends() {
        let mut log: Vec<ChatMessage> = (0..3).map(|i| message(&format!("m{i}"), i * 10)).collect();
        let mut timeline = ChatTimeline::new(10);
        timeline.load_initial(&log);

        log.push(message("m3", 30));
        log.push(message("m4", 40));
        timeline.apply_snapshot(&log);
        assert_eq!(ids(&timeline), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn out_of_order_tail_is_remerged_without_duplicates() {
        let mut timeline = ChatTimeline::new(10);
        let mut log = vec![message("m1", 10), message("m2", 20)];
        timeline.load_initial(&log);

        // A late entry lands between the visible ones, plus a duplicate of
        // m2 after the anchor.
        log = vec![
            message("m1", 10),
            message("m2", 20),
            message("m3", 15),
            message("m2", 20),
            message("m4", 30),
        ];
        timeline.apply_snapshot(&log);
        assert_eq!(ids(&timeline), vec!["m1", "m3", "m2", "m4"]);
    }

    #[test]
    fn merge_segments_without_duplicates() {
        let left = vec![message("1", 10), message("2", 20)];
        let right = vec![message("2", 20), message("3", 30)];
        let merged = merge_by_timestamp(&left, &right);
        let merged_ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(merged_ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn older_page_is_prepended() {
        let log: Vec<ChatMessage> = (0..10).map(|i| message(&format!("m{i}"), i)).collect();
        let mut timeline = ChatTimeline::new(3);
        timeline.load_initial(&log);
        assert_eq!(ids(&timeline), vec!["m7", "m8", "m9"]);

        timeline.load_older(&log);
        assert_eq!(ids(&timeline), vec!["m4", "m5", "m6", "m7", "m8", "m9"]);
        assert!(timeline.has_older());

        timeline.load_older(&log);
        timeline.load_older(&log);
        assert_eq!(timeline.visible().len(), 10);
        assert!(!timeline.has_older());
    }

    #[test]
    fn vanished_anchor_rebuilds_window() {
        let mut timeline = ChatTimeline::new(3);
        let log = vec![message("m1", 10), message("m2", 20), message("m3", 30)];
        timeline.load_initial(&log);

        // m3 was deleted out from under the window.
        let log = vec![message("m1", 10), message("m2", 20), message("m4", 40)];
        timeline.apply_snapshot(&log);
        assert_eq!(ids(&timeline), vec!["m1", "m2", "m4"]);
    }

    #[test]
    fn single_flight_guard() {
        let mut timeline = ChatTimeline::new(3);
        assert!(timeline.begin_load());
        assert!(!timeline.begin_load());
        timeline.finish_load();
        assert!(timeline.begin_load());
    }

    #[test]
    fn debouncer_coalesces_and_drains_on_fire() {
        let window = Duration::from_millis(100);
        let mut debouncer = MetadataDebouncer::new(window);
        let t0 = Instant::now();

        debouncer.request(["a"], t0);
        debouncer.request(["b", "a"], t0 + Duration::from_millis(50));

        // Window re-opened by the second trigger; nothing due yet.
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(120)), None);

        let fired = debouncer.poll(t0 + Duration::from_millis(160)).unwrap();
        assert_eq!(fired, vec!["a".to_string(), "b".to_string()]);

        // Drained; nothing more fires.
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(300)), None);
        assert_eq!(debouncer.next_deadline(), None);
    }
}

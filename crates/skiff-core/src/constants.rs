//! Application-wide constants
//!
//! Centralized location for magic values that are used across
//! multiple modules.

/// Default relay URL used when no relay configuration is supplied.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.damus.io";

/// Default chat timeline window size.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Quiescence window for coalescing profile pulls triggered by the chat
/// timeline. Repeated triggers inside this window collapse into one pull.
pub const METADATA_DEBOUNCE_MS: u64 = 250;

/// Delay before a dropped or errored relay connection is asked to
/// reconnect. Not a backoff policy; a fixed pause so a dead relay cannot
/// spin the owner loop.
pub const RECONNECT_DELAY_MS: u64 = 3_000;

// Event kinds understood by the reconciliation engine.
pub mod kinds {
    /// Profile metadata (JSON content)
    pub const PROFILE: u16 = 0;
    /// Follow list (p-tags)
    pub const FOLLOW_LIST: u16 = 3;
    /// Deletion request (e-tags and a-tags)
    pub const DELETION: u16 = 5;
    /// Live activity chat message (a-tags the activity coordinate)
    pub const CHAT_MESSAGE: u16 = 1311;
    /// Live activity (parameterized replaceable)
    pub const LIVE_ACTIVITY: u16 = 30311;
}

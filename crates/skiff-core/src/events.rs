use crate::models::ChatMessage;
use crate::relay::RelayState;

/// Notifications the engine emits to observers. Each carries only keys or
/// owned copies; observers never see shared mutable state.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Aggregate state for a relay url changed; None means the url left
    /// both pools.
    RelayStateChanged {
        url: String,
        state: Option<RelayState>,
    },
    ProfileUpdated {
        pubkey: String,
    },
    ActivityUpdated {
        coordinate: String,
    },
    ChatMessage {
        message: ChatMessage,
    },
    EventsDeleted {
        event_ids: Vec<String>,
        coordinates: Vec<String>,
    },
}

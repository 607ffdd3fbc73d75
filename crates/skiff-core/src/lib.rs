pub mod config;
pub mod constants;
pub mod events;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod subscriptions;
pub mod timeline;
pub mod tracing_setup;
pub mod trie;
pub mod verify;

pub use config::CoreConfig;
pub use events::CoreEvent;
pub use runtime::{EngineCommand, EngineHandle, SyncEngine};

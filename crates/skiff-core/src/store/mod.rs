pub mod data_store;
pub mod records;

pub use data_store::{DataStore, IngestEffect};
pub use records::{EventStore, MemoryEventStore, PersistedRecord, StoreError};

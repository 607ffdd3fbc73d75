pub mod connection;
pub mod pool;
pub mod protocol;

pub use connection::{RelayNotification, RelayPurpose, RelayState};
pub use pool::RelayPool;
pub use protocol::{ClientMessage, Filter, FilterBuilder, FilterError, ProtocolError, RelayMessage};

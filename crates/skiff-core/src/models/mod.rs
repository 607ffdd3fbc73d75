pub mod activity;
pub mod chat_message;
pub mod event;
pub mod follow_list;
pub mod profile;

pub use activity::LiveActivity;
pub use chat_message::ChatMessage;
pub use event::{Coordinate, Deletion, Event, EventPayload, Tag};
pub use follow_list::FollowList;
pub use profile::{Profile, ProfileContent};

//! Real-time job event delivery.

mod events;
mod hub;

pub use events::*;
pub use hub::{HubStats, Listener, ListenerId, NotificationHub};

//! Presence Layer
//!
//! Room membership, positions, and the two ways state leaves the server:
//! the periodic snapshot broadcast and chat fan-out.

pub mod broadcast;
pub mod chat;
pub mod registry;
pub mod state;

pub use broadcast::{BroadcastScheduler, TickReport};
pub use registry::RoomRegistry;
pub use state::{Mailbox, Player, Room, RoomId, UserId};

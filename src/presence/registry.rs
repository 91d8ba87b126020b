//! Room Registry
//!
//! Owns every room and the players present in it. The room map sits behind
//! an `RwLock`; each room has its own `Mutex`, so operations on different
//! rooms never contend and every operation on one room is serialized.
//!
//! Missing rooms are never an error: reads see an empty room and moves are
//! silent no-ops. Rooms are created on first join and are kept once empty.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::network::protocol::ServerMessage;
use crate::presence::state::{Mailbox, Player, Room, RoomId};

/// Shared handle to one room.
pub type RoomHandle = Arc<Mutex<Room>>;

/// Registry of rooms and their members.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> RoomHandle {
        if let Some(room) = self.get(room_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new())))
            .clone()
    }

    /// Put `user_id` into `room_id` at the origin.
    ///
    /// Joining again overwrites the existing record and resets the position
    /// to `(0, 0)`.
    pub async fn join(&self, room_id: &str, user_id: &str, username: &str, mailbox: Mailbox) {
        let room = self.get_or_create(room_id).await;
        room.lock().await.join(user_id, username, mailbox);
        debug!(room_id, user_id, "joined room");
    }

    /// Update a member's position.
    ///
    /// Returns `false` without touching anything if the room is unknown or
    /// the user is not in it.
    pub async fn move_player(&self, room_id: &str, user_id: &str, x: i32, y: i32) -> bool {
        match self.get(room_id).await {
            Some(room) => room.lock().await.move_player(user_id, x, y),
            None => false,
        }
    }

    /// Remove `user_id` from every room it is in.
    ///
    /// Returns the number of rooms it was removed from. Removing an absent
    /// user is a no-op.
    pub async fn leave(&self, user_id: &str) -> usize {
        let mut removed = 0;
        for room in self.handles().await {
            if room.lock().await.remove(user_id) {
                removed += 1;
            }
        }
        debug!(user_id, removed, "left rooms");
        removed
    }

    /// Current members of a room, in no particular order.
    pub async fn snapshot(&self, room_id: &str) -> Vec<Player> {
        match self.get(room_id).await {
            Some(room) => room.lock().await.players(),
            None => Vec::new(),
        }
    }

    /// Whether a room has at least one member.
    pub async fn has_members(&self, room_id: &str) -> bool {
        match self.get(room_id).await {
            Some(room) => room.lock().await.has_members(),
            None => false,
        }
    }

    /// Whether `user_id` is currently in `room_id`.
    pub async fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        match self.get(room_id).await {
            Some(room) => room.lock().await.contains(user_id),
            None => false,
        }
    }

    /// Every tracked room id, including empty rooms.
    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Number of tracked rooms, including empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Deliver a message to every member of `room_id` while holding the
    /// room lock. Returns the number of mailboxes that accepted it.
    pub async fn deliver(&self, room_id: &str, message: &ServerMessage) -> usize {
        match self.get(room_id).await {
            Some(room) => room.lock().await.deliver(message),
            None => 0,
        }
    }

    /// Handles to every room, cloned out so the map lock is released.
    pub(crate) async fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Room ids paired with their handles.
    pub(crate) async fn entries(&self) -> Vec<(RoomId, RoomHandle)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }
}

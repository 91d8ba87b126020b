//! Presence State
//!
//! Player records and the per-room member table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::network::protocol::ServerMessage;

/// User identifier, taken verbatim from the `userId` claim.
pub type UserId = String;

/// Opaque room identifier. Never validated against any catalog.
pub type RoomId = String;

/// Outbound channel for a single connection.
pub type Mailbox = mpsc::Sender<ServerMessage>;

/// A user's presence and position within one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Same value as the `userId` claim.
    pub id: UserId,
    /// Display name from the claims.
    pub username: String,
    /// Horizontal position.
    pub x: i32,
    /// Vertical position.
    pub y: i32,
}

impl Player {
    /// Create a player at the origin.
    pub fn at_origin(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            x: 0,
            y: 0,
        }
    }

    /// Current position as `(x, y)`.
    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

/// A room member: the player record plus where to deliver to it.
#[derive(Debug)]
pub(crate) struct Member {
    pub player: Player,
    pub mailbox: Mailbox,
}

/// Members of one room, keyed by user id.
#[derive(Debug, Default)]
pub struct Room {
    members: HashMap<UserId, Member>,
}

impl Room {
    /// Create an empty room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a member at the origin.
    ///
    /// A rejoin from another connection takes over the record, so only the
    /// latest mailbox keeps receiving this room's traffic.
    pub(crate) fn join(&mut self, user_id: &str, username: &str, mailbox: Mailbox) {
        let previous = self.members.insert(
            user_id.to_string(),
            Member {
                player: Player::at_origin(user_id, username),
                mailbox: mailbox.clone(),
            },
        );
        if let Some(previous) = previous {
            if !previous.mailbox.same_channel(&mailbox) {
                debug!(user_id = %user_id, "rejoin from another connection, replacing mailbox");
            }
        }
    }

    /// Update a member's position. Returns false if the user is not a member.
    pub(crate) fn move_player(&mut self, user_id: &str, x: i32, y: i32) -> bool {
        match self.members.get_mut(user_id) {
            Some(member) => {
                member.player.x = x;
                member.player.y = y;
                true
            }
            None => false,
        }
    }

    /// Remove a member. Returns true if it was present.
    pub(crate) fn remove(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id).is_some()
    }

    /// Whether the room has any members.
    pub fn has_members(&self) -> bool {
        !self.members.is_empty()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `user_id` is a member.
    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    /// Copy of every member's player record.
    pub fn players(&self) -> Vec<Player> {
        self.members.values().map(|m| m.player.clone()).collect()
    }

    /// Deliver a message to every member without waiting.
    ///
    /// A full or closed mailbox only loses this one message. Returns the
    /// number of members that accepted it.
    pub(crate) fn deliver(&self, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        for (user_id, member) in &self.members {
            match member.mailbox.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(user_id = %user_id, "mailbox full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(user_id = %user_id, "mailbox closed, dropping message");
                }
            }
        }
        delivered
    }
}

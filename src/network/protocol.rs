//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON text message shaped `{"event": <name>, "data": <payload>}`,
//! except the handshake, which is the bare auth payload `{"token": ...}`.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::presence::state::{Player, RoomId, UserId};

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known event.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// First frame of every connection.
///
/// Accepts `{"token": "..."}` or `{"auth": {"token": "..."}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handshake {
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Nested auth object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HandshakeAuth>,
}

/// Nested auth payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeAuth {
    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
}

impl Handshake {
    /// Handshake carrying `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            auth: None,
        }
    }

    /// The presented token, top-level first.
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .or_else(|| self.auth.as_ref().and_then(|a| a.token.as_deref()))
    }

    /// Parse a handshake frame.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Events sent from client to server on an active connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Enter a room at the origin.
    JoinRoom(RoomId),
    /// Set position within a room.
    Move(MoveRequest),
    /// Say something to a room.
    ChatMessage(ChatRequest),
}

/// Position update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    /// Horizontal position.
    #[serde(deserialize_with = "coordinate")]
    pub x: i32,
    /// Vertical position.
    #[serde(deserialize_with = "coordinate")]
    pub y: i32,
    /// Room the move applies to.
    pub room_id: RoomId,
}

/// Chat line from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Message text.
    pub message: String,
    /// Target room.
    pub room_id: RoomId,
}

/// Accept any JSON number, rounded and clamped into `i32`.
fn coordinate<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake refused; the socket closes right after.
    ConnectError(ErrorInfo),
    /// Handshake accepted.
    Connected(ConnectedInfo),
    /// Full member list of one room (every tick).
    PlayersUpdate(Vec<Player>),
    /// Relayed chat line.
    ChatMessage(ChatBroadcast),
    /// A frame could not be understood.
    Error(ErrorInfo),
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human readable reason.
    pub message: String,
}

impl ErrorInfo {
    /// Error payload with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Identity confirmed at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    /// The id player records will carry for this user.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
}

/// Chat line as relayed to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    /// Sender's user id.
    pub sender_id: UserId,
    /// Sender's display name.
    pub username: String,
    /// Message text.
    pub message: String,
    /// Server time at relay (RFC 3339).
    pub timestamp: String,
}

// =============================================================================
// SERIALIZATION
// =============================================================================

impl ClientEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Event name as it appears on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::ConnectError(_) => "connect_error",
            ServerMessage::Connected(_) => "connected",
            ServerMessage::PlayersUpdate(_) => "players_update",
            ServerMessage::ChatMessage(_) => "chat_message",
            ServerMessage::Error(_) => "error",
        }
    }
}

//! Chat Relay
//!
//! Stateless fan-out of a chat line to everyone currently in a room.

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::network::auth::Claims;
use crate::network::protocol::{ChatBroadcast, ServerMessage};
use crate::presence::registry::RoomRegistry;

/// Server-side timestamp for a relayed message (RFC 3339, UTC, millis).
pub fn relay_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Relay `message` from `sender` to every member of `room_id`, sender
/// included.
///
/// The sender does not need to be a member. An unknown or empty room gets
/// nothing, and nothing is queued. Returns the number of deliveries.
pub async fn relay(registry: &RoomRegistry, sender: &Claims, room_id: &str, message: String) -> usize {
    let chat = ChatBroadcast {
        sender_id: sender.user_id.clone(),
        username: sender.username.clone(),
        message,
        timestamp: relay_timestamp(),
    };

    let delivered = registry
        .deliver(room_id, &ServerMessage::ChatMessage(chat))
        .await;
    debug!(room_id, sender = %sender.user_id, delivered, "chat relayed");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tokio::sync::mpsc;

    fn claims(id: &str, name: &str) -> Claims {
        Claims { user_id: id.into(), username: name.into(), role: None }
    }

    #[tokio::test]
    async fn test_relay_reaches_all_members_including_sender() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.join("room-1", "a", "alice", tx_a).await;
        registry.join("room-1", "b", "bob", tx_b).await;

        let delivered = relay(&registry, &claims("b", "bob"), "room-1", "hi".into()).await;
        assert_eq!(delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerMessage::ChatMessage(chat) => {
                    assert_eq!(chat.sender_id, "b");
                    assert_eq!(chat.username, "bob");
                    assert_eq!(chat.message, "hi");
                    assert!(DateTime::parse_from_rfc3339(&chat.timestamp).is_ok());
                }
                other => panic!("expected chat_message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_to_unknown_room_delivers_nothing() {
        let registry = RoomRegistry::new();
        let delivered = relay(&registry, &claims("a", "alice"), "ghost", "hello?".into()).await;
        assert_eq!(delivered, 0);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_does_not_require_sender_membership() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.join("room-1", "a", "alice", tx).await;

        let delivered = relay(&registry, &claims("z", "zed"), "room-1", "knock".into()).await;
        assert_eq!(delivered, 1);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::ChatMessage(_)));
        assert!(!registry.is_member("room-1", "z").await);
    }

    #[tokio::test]
    async fn test_relay_preserves_order_per_room() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.join("room-1", "a", "alice", tx).await;

        for i in 0..5 {
            relay(&registry, &claims("a", "alice"), "room-1", format!("m{}", i)).await;
        }

        for i in 0..5 {
            match rx.try_recv().unwrap() {
                ServerMessage::ChatMessage(chat) => assert_eq!(chat.message, format!("m{}", i)),
                other => panic!("expected chat_message, got {:?}", other),
            }
        }
    }
}

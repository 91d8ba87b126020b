//! Connection Sessions
//!
//! Per-connection state machine sitting between the socket and the room
//! registry. A connection moves through
//! `Connecting -> Authenticated -> Active -> Closed`; events are only acted
//! on while `Active`, and `Closed` is terminal.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::network::auth::{AuthError, AuthGate, Claims};
use crate::network::protocol::{ClientEvent, ConnectedInfo, Handshake, ServerMessage};
use crate::presence::chat;
use crate::presence::registry::RoomRegistry;
use crate::presence::state::Mailbox;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the handshake.
    Connecting,
    /// Handshake verified, not yet accepting events.
    Authenticated,
    /// Accepting events.
    Active,
    /// Terminal.
    Closed,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Handshake verification failed.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Operation not valid in the current state.
    #[error("Invalid connection state: {0:?}")]
    InvalidState(ConnectionState),
}

/// State machine for one connection.
pub struct ConnectionHandler {
    /// Connection identifier (for logs).
    pub id: ConnectionId,
    state: ConnectionState,
    claims: Option<Claims>,
    registry: Arc<RoomRegistry>,
    mailbox: Mailbox,
}

impl ConnectionHandler {
    /// New handler in `Connecting`.
    pub fn new(registry: Arc<RoomRegistry>, mailbox: Mailbox) -> Self {
        Self::with_id(Uuid::new_v4(), registry, mailbox)
    }

    /// New handler in `Connecting` under an id the caller already assigned.
    pub fn with_id(id: ConnectionId, registry: Arc<RoomRegistry>, mailbox: Mailbox) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            claims: None,
            registry,
            mailbox,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Verified identity, once authenticated.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Verify the handshake.
    ///
    /// On failure the connection goes straight to `Closed` and nothing else
    /// is touched.
    pub fn authenticate(&mut self, gate: &AuthGate, handshake: &Handshake) -> Result<&Claims, SessionError> {
        if self.state != ConnectionState::Connecting {
            return Err(SessionError::InvalidState(self.state));
        }

        match gate.verify(handshake.token()) {
            Ok(claims) => {
                self.state = ConnectionState::Authenticated;
                Ok(&*self.claims.insert(claims))
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Start accepting events and tell the client who it is.
    pub fn activate(&mut self) -> Result<(), SessionError> {
        let claims = match (&self.state, &self.claims) {
            (ConnectionState::Authenticated, Some(claims)) => claims,
            _ => return Err(SessionError::InvalidState(self.state)),
        };

        let connected = ServerMessage::Connected(ConnectedInfo {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
        });
        if let Err(e) = self.mailbox.try_send(connected) {
            debug!(connection = %self.id, error = %e, "connected notice not queued");
        }
        self.state = ConnectionState::Active;
        info!(connection = %self.id, user_id = %claims.user_id, "connection active");
        Ok(())
    }

    /// Dispatch one inbound event.
    ///
    /// Returns `false` if the event was dropped because the connection is
    /// not active.
    pub async fn handle(&self, event: ClientEvent) -> bool {
        let claims = match (&self.state, &self.claims) {
            (ConnectionState::Active, Some(claims)) => claims,
            _ => {
                debug!(connection = %self.id, state = ?self.state, "dropping event");
                return false;
            }
        };

        match event {
            ClientEvent::JoinRoom(room_id) => {
                self.registry
                    .join(&room_id, &claims.user_id, &claims.username, self.mailbox.clone())
                    .await;
                info!(user = %claims.username, room_id = %room_id, "joined room");
            }
            ClientEvent::Move(req) => {
                self.registry
                    .move_player(&req.room_id, &claims.user_id, req.x, req.y)
                    .await;
            }
            ClientEvent::ChatMessage(req) => {
                chat::relay(&self.registry, claims, &req.room_id, req.message).await;
            }
        }
        true
    }

    /// Close the connection.
    ///
    /// The first call after a successful handshake removes the user from
    /// every room. Later calls do nothing. Returns whether this call did the
    /// transition.
    pub async fn close(&mut self) -> bool {
        let was_authenticated = match self.state {
            ConnectionState::Closed => return false,
            ConnectionState::Connecting => false,
            ConnectionState::Authenticated | ConnectionState::Active => true,
        };
        self.state = ConnectionState::Closed;

        if was_authenticated {
            if let Some(claims) = &self.claims {
                let rooms = self.registry.leave(&claims.user_id).await;
                info!(connection = %self.id, user = %claims.username, rooms, "user disconnected");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::tests::{token_for, SECRET};
    use crate::network::auth::AuthConfig;
    use crate::network::protocol::{ChatRequest, MoveRequest};
    use tokio::sync::mpsc;

    fn gate() -> AuthGate {
        AuthGate::new(AuthConfig::with_secret(SECRET)).unwrap()
    }

    async fn active_handler(
        registry: &Arc<RoomRegistry>,
        user_id: &str,
        username: &str,
    ) -> (ConnectionHandler, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(32);
        let mut handler = ConnectionHandler::new(registry.clone(), tx);
        handler
            .authenticate(&gate(), &Handshake::with_token(token_for(user_id, username)))
            .unwrap();
        handler.activate().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Connected(_)));
        (handler, rx)
    }

    #[tokio::test]
    async fn test_state_progression() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut handler = ConnectionHandler::new(registry, tx);
        assert_eq!(handler.state(), ConnectionState::Connecting);

        handler
            .authenticate(&gate(), &Handshake::with_token(token_for("u1", "alice")))
            .unwrap();
        assert_eq!(handler.state(), ConnectionState::Authenticated);
        assert_eq!(handler.claims().unwrap().user_id, "u1");

        handler.activate().unwrap();
        assert_eq!(handler.state(), ConnectionState::Active);

        assert!(handler.close().await);
        assert_eq!(handler.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_activate_with_full_mailbox_still_activates() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(ServerMessage::PlayersUpdate(Vec::new())).unwrap();

        let id = Uuid::new_v4();
        let mut handler = ConnectionHandler::with_id(id, registry, tx);
        assert_eq!(handler.id, id);
        handler
            .authenticate(&gate(), &Handshake::with_token(token_for("u1", "alice")))
            .unwrap();
        handler.activate().unwrap();

        assert_eq!(handler.state(), ConnectionState::Active);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::PlayersUpdate(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_auth_closes_without_trace() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut handler = ConnectionHandler::new(registry.clone(), tx);

        let result = handler.authenticate(&gate(), &Handshake::default());
        assert!(matches!(result, Err(SessionError::Auth(AuthError::MissingToken))));
        assert_eq!(handler.state(), ConnectionState::Closed);

        assert!(!handler.handle(ClientEvent::JoinRoom("room-1".into())).await);
        assert!(handler.activate().is_err());
        assert!(!handler.close().await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_events_ignored_before_active() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut handler = ConnectionHandler::new(registry.clone(), tx);
        handler
            .authenticate(&gate(), &Handshake::with_token(token_for("u1", "alice")))
            .unwrap();

        assert!(!handler.handle(ClientEvent::JoinRoom("room-1".into())).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_move_chat_dispatch() {
        let registry = Arc::new(RoomRegistry::new());
        let (handler, mut rx) = active_handler(&registry, "u1", "alice").await;

        assert!(handler.handle(ClientEvent::JoinRoom("room-1".into())).await);
        assert!(
            handler
                .handle(ClientEvent::Move(MoveRequest { x: 4, y: 5, room_id: "room-1".into() }))
                .await
        );
        assert_eq!(registry.snapshot("room-1").await[0].position(), (4, 5));

        handler
            .handle(ClientEvent::ChatMessage(ChatRequest { message: "yo".into(), room_id: "room-1".into() }))
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::ChatMessage(chat) => {
                assert_eq!(chat.sender_id, "u1");
                assert_eq!(chat.message, "yo");
            }
            other => panic!("expected chat_message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_move_in_unjoined_room_is_silent() {
        let registry = Arc::new(RoomRegistry::new());
        let (handler, mut rx) = active_handler(&registry, "u1", "alice").await;

        assert!(
            handler
                .handle(ClientEvent::Move(MoveRequest { x: 1, y: 1, room_id: "elsewhere".into() }))
                .await
        );
        assert_eq!(registry.room_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_leaves_every_room_once() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut handler, _rx) = active_handler(&registry, "u1", "alice").await;
        let (other, _other_rx) = active_handler(&registry, "u2", "bob").await;

        handler.handle(ClientEvent::JoinRoom("a".into())).await;
        handler.handle(ClientEvent::JoinRoom("b".into())).await;
        other.handle(ClientEvent::JoinRoom("b".into())).await;

        assert!(handler.close().await);
        assert!(!handler.close().await);

        assert!(!registry.is_member("a", "u1").await);
        assert!(!registry.is_member("b", "u1").await);
        assert!(registry.is_member("b", "u2").await);
        assert!(!handler.handle(ClientEvent::JoinRoom("a".into())).await);
        assert!(!registry.is_member("a", "u1").await);
    }
}

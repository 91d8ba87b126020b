//! Network Layer
//!
//! WebSocket server, handshake authentication, wire protocol and the
//! per-connection state machine.

pub mod auth;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, AuthError, AuthGate, Claims, TokenClaims, validate_token};
pub use protocol::{ClientEvent, Handshake, ProtocolError, ServerMessage};
pub use session::{ConnectionHandler, ConnectionId, ConnectionState, SessionError};
pub use server::{RelayServer, RelayServerError, ServerConfig};

//! # Presence Relay Server
//!
//! Real-time room presence and chat relay over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PRESENCE RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  presence/         - Room state                              │
//! │  ├── state.rs      - Player and Room records                 │
//! │  ├── registry.rs   - Room registry (per-room locking)        │
//! │  ├── broadcast.rs  - Fixed-rate players_update scheduler     │
//! │  └── chat.rs       - Chat fan-out                            │
//! │                                                              │
//! │  network/          - Networking                              │
//! │  ├── auth.rs       - JWT handshake verification              │
//! │  ├── protocol.rs   - Message types                           │
//! │  ├── session.rs    - Per-connection state machine            │
//! │  └── server.rs     - WebSocket server                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Every connection owns a bounded outbound mailbox. Room fan-out never
//! waits on a mailbox: a slow or dead peer only loses its own messages.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod presence;

// Re-export commonly used types
pub use network::{AuthConfig, AuthGate, Claims, RelayServer, ServerConfig};
pub use presence::{BroadcastScheduler, Player, RoomRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Broadcast period in milliseconds (20 Hz)
pub const TICK_INTERVAL_MS: u64 = 50;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3002;

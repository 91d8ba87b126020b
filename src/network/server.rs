//! WebSocket Relay Server
//!
//! Async WebSocket server. Accepts sockets, runs the handshake, pumps
//! events into a [`ConnectionHandler`] per socket and drives the broadcast
//! scheduler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::network::auth::{AuthConfig, AuthError, AuthGate};
use crate::network::protocol::{ClientEvent, ErrorInfo, Handshake, ProtocolError, ServerMessage};
use crate::network::session::{ConnectionHandler, ConnectionId, SessionError};
use crate::presence::broadcast::BroadcastScheduler;
use crate::presence::registry::RoomRegistry;
use crate::presence::state::UserId;
use crate::{DEFAULT_PORT, TICK_INTERVAL_MS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a new socket has to present its token.
    pub handshake_timeout: Duration,
    /// Broadcast period.
    pub tick_interval: Duration,
    /// Outbound queue depth per connection.
    pub mailbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            mailbox_capacity: 64,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("RELAY_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            handshake_timeout: env_parse("RELAY_HANDSHAKE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake_timeout),
            tick_interval: env_parse("RELAY_TICK_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            mailbox_capacity: env_parse("RELAY_MAILBOX_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.mailbox_capacity),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Authentication is not usable.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Connected client bookkeeping.
struct ConnectedClient {
    /// Peer address.
    addr: SocketAddr,
    /// User identifier (after handshake).
    user_id: Option<UserId>,
    /// Connection time.
    connected_at: Instant,
}

type ClientMap = Arc<RwLock<HashMap<ConnectionId, ConnectedClient>>>;

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<RoomRegistry>,
    gate: AuthGate,
    clients: ClientMap,
    config: ServerConfig,
}

/// The relay server.
pub struct RelayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Bound listener.
    listener: TcpListener,
    /// Handshake verification.
    gate: AuthGate,
    /// Shared room state.
    registry: Arc<RoomRegistry>,
    /// Connected clients.
    clients: ClientMap,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind the listener. Fails if auth has no key material.
    pub async fn bind(config: ServerConfig, auth: AuthConfig) -> Result<Self, RelayServerError> {
        let gate = AuthGate::new(auth)?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            gate,
            registry: Arc::new(RoomRegistry::new()),
            clients: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared room registry.
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Run the server until [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayServerError> {
        info!("Relay server listening on {}", self.local_addr()?);

        let scheduler = BroadcastScheduler::new(self.registry.clone(), self.config.tick_interval);
        let scheduler_handle = tokio::spawn(scheduler.run(self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let Some(conn_id) = self.reserve_slot(addr).await else {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            };

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr, conn_id);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Err(e) = scheduler_handle.await {
            error!("Broadcast scheduler task failed: {}", e);
        }

        Ok(())
    }

    /// Claim a client slot for a freshly accepted socket. The slot is held
    /// from accept until the connection task ends, upgrade included.
    async fn reserve_slot(&self, addr: SocketAddr) -> Option<ConnectionId> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_connections {
            return None;
        }

        let conn_id = Uuid::new_v4();
        clients.insert(conn_id, ConnectedClient {
            addr,
            user_id: None,
            connected_at: Instant::now(),
        });
        Some(conn_id)
    }

    /// Spawn the task for one socket.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, conn_id: ConnectionId) {
        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            gate: self.gate.clone(),
            clients: self.clients.clone(),
            config: self.config.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            match tokio::time::timeout(ctx.config.handshake_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => Self::serve(ws_stream, addr, conn_id, &ctx, shutdown_rx).await,
                Ok(Err(e)) => error!("WebSocket handshake failed for {}: {}", addr, e),
                Err(_) => warn!("WebSocket upgrade from {} timed out", addr),
            }

            if let Some(client) = ctx.clients.write().await.remove(&conn_id) {
                info!(
                    "Client {} ({}) cleaned up after {:?}",
                    client.addr,
                    client.user_id.as_deref().unwrap_or("-"),
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Drive one connection from handshake to cleanup.
    async fn serve(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        conn_id: ConnectionId,
        ctx: &ConnectionContext,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(ctx.config.mailbox_capacity);
        let mut handler = ConnectionHandler::with_id(conn_id, ctx.registry.clone(), msg_tx.clone());

        // Writer: drains the mailbox into the socket. Stops after a
        // connect_error so the refused socket gets closed.
        let mut sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if matches!(msg, ServerMessage::ConnectError(_)) {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        });

        // Handshake
        let handshake = tokio::time::timeout(ctx.config.handshake_timeout, read_handshake(&mut ws_receiver)).await;
        let refusal = match handshake {
            Err(_) => Some("handshake timed out".to_string()),
            Ok(None) => {
                debug!("Client {} left before handshake", addr);
                None
            }
            Ok(Some(Err(e))) => Some(e.to_string()),
            Ok(Some(Ok(handshake))) => match handler.authenticate(&ctx.gate, &handshake) {
                Ok(_) => None,
                Err(SessionError::Auth(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            },
        };

        if let Some(reason) = refusal {
            warn!("Refusing connection from {}: {}", addr, reason);
            handler.close().await;
            let _ = msg_tx
                .send(ServerMessage::ConnectError(ErrorInfo::new(format!("Authentication error: {}", reason))))
                .await;
            drop(msg_tx);
            drop(handler);
            if tokio::time::timeout(Duration::from_secs(1), &mut sender_task).await.is_err() {
                sender_task.abort();
            }
            return;
        }

        if handler.activate().is_err() {
            // Socket closed before the handshake arrived.
            sender_task.abort();
            return;
        }

        if let Some(client) = ctx.clients.write().await.get_mut(&conn_id) {
            client.user_id = handler.claims().map(|c| c.user_id.clone());
        }

        // Event loop
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match ClientEvent::from_json(&text) {
                                Ok(event) => {
                                    handler.handle(event).await;
                                }
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = msg_tx.try_send(ServerMessage::Error(ErrorInfo::new("Invalid message format")));
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("Ignoring binary frame from {}", addr);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        // Cleanup
        handler.close().await;
        sender_task.abort();
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Wait for the handshake frame. `None` if the socket went away first.
async fn read_handshake(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<Result<Handshake, ProtocolError>> {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(Handshake::from_json(&text)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Binary(data)) => {
                return Some(serde_json::from_slice(&data).map_err(ProtocolError::from));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(Message::Frame(_)) => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::tests::SECRET;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 3002);
    }

    #[test]
    fn test_env_parse_rejects_bad_values() {
        std::env::set_var("RELAY_TEST_PARSE_BAD", "not-a-number");
        std::env::set_var("RELAY_TEST_PARSE_GOOD", "42");

        assert_eq!(env_parse::<usize>("RELAY_TEST_PARSE_BAD"), None);
        assert_eq!(env_parse::<usize>("RELAY_TEST_PARSE_GOOD"), Some(42));
        assert_eq!(env_parse::<usize>("RELAY_TEST_PARSE_UNSET"), None);

        std::env::remove_var("RELAY_TEST_PARSE_BAD");
        std::env::remove_var("RELAY_TEST_PARSE_GOOD");
    }

    #[test]
    fn test_from_env_falls_back_on_zero_and_garbage() {
        std::env::set_var("RELAY_TICK_MS", "0");
        std::env::set_var("RELAY_MAILBOX_CAPACITY", "lots");
        std::env::set_var("RELAY_MAX_CONNECTIONS", "5");
        std::env::set_var("RELAY_BIND_ADDR", "127.0.0.1:4000");

        let config = ServerConfig::from_env();
        assert_eq!(config.tick_interval, Duration::from_millis(TICK_INTERVAL_MS));
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.bind_addr, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());

        for key in ["RELAY_TICK_MS", "RELAY_MAILBOX_CAPACITY", "RELAY_MAX_CONNECTIONS", "RELAY_BIND_ADDR"] {
            std::env::remove_var(key);
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = RelayServer::bind(local_config(), AuthConfig::with_secret(SECRET))
            .await
            .unwrap();

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.registry().room_count().await, 0);
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_requires_auth_config() {
        let result = RelayServer::bind(local_config(), AuthConfig::default()).await;
        assert!(matches!(result, Err(RelayServerError::Auth(AuthError::NotConfigured))));
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(
            RelayServer::bind(local_config(), AuthConfig::with_secret(SECRET))
                .await
                .unwrap(),
        );
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        // Give run() a moment to subscribe before signalling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

//! WebSocket connection accounting.
//!
//! Each upgraded socket gets a connection id and an accounting record. A
//! connection binds to at most one session at a time. The health sweep
//! closes connections whose last activity is older than the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use http::header::{CONNECTION, UPGRADE};
use http::HeaderMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// The JPIP WebSocket sub-protocol identifier.
pub const JPIP_SUBPROTOCOL: &str = "jpip";

/// Connection limits and switches.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_connections: usize,
    pub websocket_enabled: bool,

    /// Connections quiet past this are closed by the health sweep
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            websocket_enabled: true,
            connection_timeout: Duration::from_secs(120),
        }
    }
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// `Upgrade: websocket` header missing or wrong
    NotWebSocket,

    /// `Connection` header does not request an upgrade
    MissingConnectionUpgrade,

    /// Server is stopped
    ServerStopped,

    /// Connection limit reached
    TooManyConnections,

    /// WebSocket transport disabled by configuration
    WebSocketDisabled,
}

impl UpgradeRejection {
    pub fn message(&self) -> &'static str {
        match self {
            UpgradeRejection::NotWebSocket => "upgrade header is not websocket",
            UpgradeRejection::MissingConnectionUpgrade => "connection header lacks upgrade",
            UpgradeRejection::ServerStopped => "server is stopped",
            UpgradeRejection::TooManyConnections => "connection limit reached",
            UpgradeRejection::WebSocketDisabled => "websocket transport disabled",
        }
    }
}

/// Validate the upgrade handshake headers.
///
/// Requires `Upgrade: websocket` (case-insensitive) and a `Connection`
/// header containing the token `upgrade`.
pub fn validate_upgrade_headers(headers: &HeaderMap) -> Result<(), UpgradeRejection> {
    let upgrade_ok = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(UpgradeRejection::NotWebSocket);
    }

    let connection_ok = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    if !connection_ok {
        return Err(UpgradeRejection::MissingConnectionUpgrade);
    }
    Ok(())
}

/// Per-connection accounting record.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub channel_id: Option<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Aggregate connection counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_closed: u64,
}

/// Owns every live connection record.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
    accepted: RwLock<u64>,
    rejected: RwLock<u64>,
    closed: RwLock<u64>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            accepted: RwLock::new(0),
            rejected: RwLock::new(0),
            closed: RwLock::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Admit a new connection and mint its id.
    ///
    /// `server_running` reflects the engine state; a stopped server rejects
    /// upgrades outright.
    pub async fn try_register(&self, server_running: bool) -> Result<String, UpgradeRejection> {
        if !server_running {
            *self.rejected.write().await += 1;
            return Err(UpgradeRejection::ServerStopped);
        }
        if !self.config.websocket_enabled {
            *self.rejected.write().await += 1;
            return Err(UpgradeRejection::WebSocketDisabled);
        }

        let mut connections = self.connections.write().await;
        if connections.len() >= self.config.max_connections {
            *self.rejected.write().await += 1;
            return Err(UpgradeRejection::TooManyConnections);
        }

        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        connections.insert(
            id.clone(),
            ConnectionInfo {
                id: id.clone(),
                channel_id: None,
                created_at: now,
                last_activity: now,
                bytes_sent: 0,
                bytes_received: 0,
            },
        );
        *self.accepted.write().await += 1;
        info!(connection_id = %id, "connection accepted");
        Ok(id)
    }

    /// Bind a connection to a session channel. A connection holds at most
    /// one binding; rebinding replaces it.
    pub async fn bind_session(&self, connection_id: &str, channel_id: &str) {
        if let Some(info) = self.connections.write().await.get_mut(connection_id) {
            info.channel_id = Some(channel_id.to_string());
            info.last_activity = Instant::now();
        }
    }

    /// Channel bound to a connection, if any.
    pub async fn session_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .and_then(|info| info.channel_id.clone())
    }

    pub async fn record_received(&self, connection_id: &str, bytes: u64) {
        if let Some(info) = self.connections.write().await.get_mut(connection_id) {
            info.bytes_received += bytes;
            info.last_activity = Instant::now();
        }
    }

    pub async fn record_sent(&self, connection_id: &str, bytes: u64) {
        if let Some(info) = self.connections.write().await.get_mut(connection_id) {
            info.bytes_sent += bytes;
            info.last_activity = Instant::now();
        }
    }

    /// Remove one connection. Returns its record.
    pub async fn remove(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let removed = self.connections.write().await.remove(connection_id);
        if removed.is_some() {
            *self.closed.write().await += 1;
            debug!(connection_id = %connection_id, "connection closed");
        }
        removed
    }

    /// Close connections quiet past the configured timeout. Returns the
    /// ids closed, so the socket loop can drop them.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let timeout = self.config.connection_timeout;
        let mut connections = self.connections.write().await;
        let victims: Vec<String> = connections
            .values()
            .filter(|info| info.last_activity.elapsed() > timeout)
            .map(|info| info.id.clone())
            .collect();
        for id in &victims {
            connections.remove(id);
        }
        if !victims.is_empty() {
            *self.closed.write().await += victims.len() as u64;
            info!(closed = victims.len(), "idle connections closed");
        }
        victims
    }

    pub async fn info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.connections.read().await.len(),
            total_accepted: *self.accepted.read().await,
            total_rejected: *self.rejected.read().await,
            total_closed: *self.closed.read().await,
        }
    }
}

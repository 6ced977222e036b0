//! Configuration management for the JPIP streamer binary.
//!
//! Command-line arguments via clap, environment variables with the `JPIP_`
//! prefix, and defaults for everything optional.
//!
//! # Environment Variables
//!
//! - `JPIP_HOST` - Server bind address (default: 0.0.0.0)
//! - `JPIP_PORT` - Server port (default: 3000)
//! - `JPIP_DATA_DIR` - Directory of codestreams to register as targets
//! - `JPIP_SESSION_DIR` - Directory for persisted session snapshots
//! - `JPIP_MAX_CONNECTIONS` - WebSocket connection limit (default: 256)
//! - `JPIP_WEBSOCKET_ENABLED` - Enable the WebSocket transport (default: true)
//! - `JPIP_GLOBAL_LIMIT_BPS` - Global bandwidth limit in bytes/second
//! - `JPIP_CLIENT_LIMIT_BPS` - Per-client bandwidth limit in bytes/second
//! - `JPIP_SESSION_TIMEOUT` - Session idle timeout in seconds (default: 300)
//! - `JPIP_CONNECTION_TIMEOUT` - Connection idle timeout in seconds (default: 120)
//! - `JPIP_QUEUE_CAPACITY` - Request queue capacity (default: 256)

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::server::{ConnectionConfig, EngineConfig, ThrottleConfig};

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default session idle timeout in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

/// Default connection idle timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 120;

/// Default request queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default maximum WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// JPIP Streamer - an interactive streaming server for JPEG 2000 imagery.
///
/// Serves arbitrary spatial regions, resolution levels and quality layers
/// of large compressed images progressively over WebSocket, with an HTTP
/// fallback.
#[derive(Parser, Debug, Clone)]
#[command(name = "jpip-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "JPIP_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "JPIP_PORT")]
    pub port: u16,

    // =========================================================================
    // Target Configuration
    // =========================================================================
    /// Directory of `.jp2`/`.j2k` codestreams to register as targets.
    #[arg(long, env = "JPIP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for persisted session snapshots.
    #[arg(long, env = "JPIP_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,

    // =========================================================================
    // Connection Configuration
    // =========================================================================
    /// Maximum simultaneous WebSocket connections.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "JPIP_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Enable the WebSocket transport.
    #[arg(long, default_value_t = true, env = "JPIP_WEBSOCKET_ENABLED")]
    pub websocket_enabled: bool,

    /// Close connections idle for this many seconds.
    #[arg(long, default_value_t = DEFAULT_CONNECTION_TIMEOUT_SECS, env = "JPIP_CONNECTION_TIMEOUT")]
    pub connection_timeout_secs: u64,

    // =========================================================================
    // Session Configuration
    // =========================================================================
    /// Expire sessions idle for this many seconds.
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS, env = "JPIP_SESSION_TIMEOUT")]
    pub session_timeout_secs: u64,

    /// Request queue capacity.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, env = "JPIP_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    // =========================================================================
    // Bandwidth Configuration
    // =========================================================================
    /// Global bandwidth limit in bytes/second. Unset means unlimited.
    #[arg(long, env = "JPIP_GLOBAL_LIMIT_BPS")]
    pub global_limit_bps: Option<u64>,

    /// Per-client bandwidth limit in bytes/second. Unset means unlimited.
    #[arg(long, env = "JPIP_CLIENT_LIMIT_BPS")]
    pub client_limit_bps: Option<u64>,
}

impl Config {
    /// Validate field combinations before starting the server.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.max_connections == 0 {
            return Err("max-connections must be positive".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue-capacity must be positive".to_string());
        }
        if self.global_limit_bps == Some(0) {
            return Err("global-limit-bps must be positive when set".to_string());
        }
        if self.client_limit_bps == Some(0) {
            return Err("client-limit-bps must be positive when set".to_string());
        }
        Ok(())
    }

    /// The `host:port` address to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine configuration derived from the CLI surface.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_capacity: self.queue_capacity,
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            throttle: ThrottleConfig {
                global_limit_bps: self.global_limit_bps,
                per_client_limit_bps: self.client_limit_bps,
            },
            ..Default::default()
        }
    }

    /// Connection configuration derived from the CLI surface.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_connections: self.max_connections,
            websocket_enabled: self.websocket_enabled,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
        }
    }
}

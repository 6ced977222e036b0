//! Server side of the streaming engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          HTTP / WebSocket                        │
//! │     GET /jpip?target=...      GET /ws (binary frame protocol)    │
//! │                                                                  │
//! │  ┌────────────┐  ┌───────────┐  ┌──────────┐  ┌───────────────┐  │
//! │  │  handlers  │→ │  engine   │→ │  queue   │  │  connection   │  │
//! │  │  (axum)    │  │ (dispatch)│  │ throttle │  │   manager     │  │
//! │  └────────────┘  └───────────┘  └──────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod engine;
pub mod handlers;
pub mod queue;
pub mod throttle;

pub use connection::{
    validate_upgrade_headers, ConnectionConfig, ConnectionInfo, ConnectionManager,
    ConnectionStats, UpgradeRejection, JPIP_SUBPROTOCOL,
};
pub use engine::{EngineConfig, EngineResponse, EngineStats, RequestEngine};
pub use handlers::{
    create_router, parse_cnew_cid, AppState, ErrorResponse, HealthResponse, StatsResponse,
};
pub use queue::{derive_priority, QueuedRequest, RequestQueue};
pub use throttle::{BandwidthThrottle, ThrottleConfig, TokenBucket};

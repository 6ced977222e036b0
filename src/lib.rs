//! # JPIP Streamer
//!
//! The core of an interactive streaming engine for JPEG 2000 imagery
//! following the JPIP standard (ISO/IEC 15444-9).
//!
//! A server holds compressed codestreams and extracts the minimum set of
//! data bins needed to satisfy each view-window request; a client fetches
//! arbitrary spatial regions, resolution levels, quality layers and
//! components progressively, refining what it already has rather than
//! retransmitting it. Delivery adapts to measured bandwidth, and the
//! server predictively pushes bins the client is about to need.
//!
//! ## Architecture
//!
//! - [`codestream`] - Data-bin decomposition and the codestream adapter
//! - [`cache`] - Bin, precinct and resolution-aware caches
//! - [`session`] - Client/server sessions, persistence and recovery
//! - [`request`] - View-window requests and query binding
//! - [`geometry`] - Viewports, frusta and streaming regions
//! - [`stream`] - Bandwidth estimation, adaptive quality, tile
//!   prioritization and progressive delivery
//! - [`push`] - Predictive prefetch and server push
//! - [`transport`] - Binary framing and the multiplexed WebSocket client
//! - [`server`] - Request engine, priority queue, throttle and the axum
//!   HTTP/WebSocket surface
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use jpip_streamer::codestream::MarkerCodestream;
//! use jpip_streamer::server::{AppState, ConnectionConfig, ConnectionManager, EngineConfig, RequestEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(RequestEngine::new(
//!         MarkerCodestream::new(),
//!         EngineConfig::default(),
//!     ));
//!     let connections = Arc::new(ConnectionManager::new(ConnectionConfig::default()));
//!     let router = jpip_streamer::server::create_router(AppState { engine, connections });
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod codestream;
pub mod config;
pub mod error;
pub mod geometry;
pub mod push;
pub mod request;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheModel, CacheStats, FsStore, ImageCachePolicy, MemoryStore, PersistentStore,
    PrecinctCache, ResolutionCacheManager, UsageReport,
};
pub use codestream::{
    BinClass, CodestreamFormat, CodestreamSource, DataBin, MarkerCodestream, PrecinctId,
    TranscodeDirection,
};
pub use config::Config;
pub use error::{ProtocolError, ServerError, SessionError, StoreError, TransportError};
pub use geometry::{AxisRange, Frustum, StreamingRegion, Viewport, Viewport3D};
pub use push::{PushAcceptance, PushManager, PushManagerConfig};
pub use request::{RequestTemplates, ViewWindowRequest};
pub use server::{
    create_router, AppState, ConnectionConfig, ConnectionManager, EngineConfig, RequestEngine,
};
pub use session::{
    ClientSession, RecoveryConfig, RecoveryManager, RecoveryOutcome, ServerSession,
    SessionSnapshot,
};
pub use stream::{
    AdaptiveQualityEngine, BandwidthConfig, BandwidthEstimate, BandwidthEstimator,
    DeliveryScheduler, ProgressionMode, ProgressivePipeline, QualityConfig, TileManager,
    TileManagerConfig,
};
pub use transport::{ClientConfig, Frame, FrameChannel, FrameType, JpipClient, ResponsePayload};

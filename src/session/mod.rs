//! Client and server session state.
//!
//! A session owns its caches exclusively: nothing else mutates them. The
//! client session tracks what has been received; the server session tracks
//! what has been sent (its view of the client cache), which is what delta
//! delivery filters against.
//!
//! - [`client`] - Client-side session with bin and precinct caches
//! - [`server`] - Server-side session and registry with timeout sweeping
//! - [`persistence`] - Versioned snapshots and bounded recovery

pub mod client;
pub mod persistence;
pub mod server;

pub use client::{ClientSession, ClientSessionStats};
pub use persistence::{
    RecoveryConfig, RecoveryManager, RecoveryOutcome, SessionSnapshot, SNAPSHOT_VERSION,
};
pub use server::{ServerSession, ServerSessionRegistry};

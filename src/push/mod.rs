//! Server-side predictive push.
//!
//! Watches each session's navigation history, predicts what the client
//! will look at next, and pushes the matching bins ahead of demand:
//!
//! - [`predictor`] - Movement, resolution and spatial-locality predictions
//!   with confidence scoring.
//! - [`scheduler`] - The bounded priority queue of pending pushes.
//! - [`tracker`] - The server's model of each client's cache, which delta
//!   delivery filters against.
//! - [`manager`] - Composes predictor, scheduler, tracker and throttle,
//!   honoring per-session push acceptance.

pub mod manager;
pub mod predictor;
pub mod scheduler;
pub mod tracker;

pub use manager::{PushAcceptance, PushManager, PushManagerConfig};
pub use predictor::{
    Aggressiveness, PrefetchConfig, PrefetchEngine, PrefetchPriority, TilePrediction,
};
pub use scheduler::{PushItem, PushScheduler};
pub use tracker::ClientCacheTracker;

//! Integration tests for the JPIP streamer.
//!
//! These tests verify end-to-end functionality including:
//! - HTTP API behavior (channel creation, data dispatch, error codes)
//! - The binary frame protocol over an in-memory channel
//! - Client/server cache interplay and delta delivery
//! - Predictive push against a server-tracked client cache
//! - Session persistence and recovery across restarts

mod integration {
    pub mod test_utils;

    pub mod api_tests;
    pub mod persistence_tests;
    pub mod push_tests;
    pub mod streaming_tests;
    pub mod transport_tests;
}

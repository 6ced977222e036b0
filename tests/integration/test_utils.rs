//! Shared helpers for integration tests.

use std::sync::Arc;

use jpip_streamer::codestream::MarkerCodestream;
use jpip_streamer::server::{
    AppState, ConnectionConfig, ConnectionManager, EngineConfig, RequestEngine,
};

/// A small but structurally complete codestream: main header, one tile
/// part with a bounded-by-scan tile body, EOC.
pub fn sample_codestream() -> Vec<u8> {
    vec![
        0xFF, 0x4F, // SOC
        0xFF, 0x52, 0x00, 0x04, 0x00, 0x00, // COD
        0xFF, 0x90, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // SOT
        0xFF, 0x93, // SOD
        0xDE, 0xAD, 0xBE, 0xEF, // tile data
        0xFF, 0xD9, // EOC
    ]
}

/// An engine with the sample codestream registered as `img.jp2`.
pub async fn engine_with_sample() -> Arc<RequestEngine<MarkerCodestream>> {
    let engine = Arc::new(RequestEngine::new(
        MarkerCodestream::new(),
        EngineConfig::default(),
    ));
    engine
        .register_target("img.jp2", sample_codestream())
        .await
        .expect("sample codestream registers");
    engine
}

/// Full handler state over a fresh engine and connection manager.
pub async fn app_state() -> AppState<MarkerCodestream> {
    AppState {
        engine: engine_with_sample().await,
        connections: Arc::new(ConnectionManager::new(ConnectionConfig::default())),
    }
}

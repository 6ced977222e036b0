//! HTTP API integration tests.
//!
//! Tests verify:
//! - Channel creation over `GET /jpip` with `cnew`
//! - Data dispatch and delta filtering across requests on one channel
//! - Error status codes (bad query, unknown target, throttled)
//! - Health and stats endpoints

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use jpip_streamer::codestream::MarkerCodestream;
use jpip_streamer::server::{
    create_router, parse_cnew_cid, AppState, ConnectionConfig, ConnectionManager, EngineConfig,
    RequestEngine, ThrottleConfig,
};

use super::test_utils::{app_state, sample_codestream};

async fn get(router: axum::Router, uri: &str) -> (StatusCode, Vec<(String, String)>, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_channel_creation_over_http() {
    let router = create_router(app_state().await);
    let (status, headers, body) =
        get(router, "/jpip?target=img.jp2&cnew=http").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let cnew = header(&headers, "JPIP-cnew").expect("JPIP-cnew header present");
    assert!(cnew.contains("path=/jpip"));
    assert!(cnew.contains("transport=http"));
    assert!(parse_cnew_cid(cnew).is_some());
    assert_eq!(header(&headers, "JPIP-cap"), Some("j2k"));
    assert_eq!(header(&headers, "JPIP-tid"), Some("img.jp2"));
}

#[tokio::test]
async fn test_data_request_and_delta_across_channel() {
    let state = app_state().await;
    let router = create_router(state.clone());

    let (_, headers, _) = get(router.clone(), "/jpip?target=img.jp2&cnew=http").await;
    let cid = parse_cnew_cid(header(&headers, "JPIP-cnew").unwrap()).unwrap();

    // First data request: bins stream in, main header first.
    let (status, _, body) =
        get(router.clone(), &format!("/jpip?target=img.jp2&cid={cid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..2], &[0xFF, 0x4F]);

    // Second data request: everything filtered, raw codestream fallback.
    let (status, _, body) = get(router, &format!("/jpip?target=img.jp2&cid={cid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, sample_codestream());
}

#[tokio::test]
async fn test_unknown_target_is_404() {
    let router = create_router(app_state().await);
    let (status, _, _) = get(router, "/jpip?target=ghost.jp2&cnew=http").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_query_is_400() {
    let router = create_router(app_state().await);
    let (status, _, _) = get(router.clone(), "/jpip?target=img.jp2&rsiz=0,0&cnew=http").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(router, "/jpip?layers=notanumber").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_channel_is_400() {
    let router = create_router(app_state().await);
    let (status, _, _) = get(router, "/jpip?target=img.jp2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_throttled_is_503_with_retry_after() {
    let mut config = EngineConfig::default();
    config.throttle = ThrottleConfig {
        global_limit_bps: Some(600),
        per_client_limit_bps: None,
    };
    let engine = std::sync::Arc::new(RequestEngine::new(MarkerCodestream::new(), config));
    engine
        .register_target("img.jp2", sample_codestream())
        .await
        .unwrap();
    let state = AppState {
        engine,
        connections: std::sync::Arc::new(ConnectionManager::new(ConnectionConfig::default())),
    };
    let router = create_router(state);

    // First request drains the 1200-token bucket below the probe budget.
    let (status, _, _) = get(router.clone(), "/jpip?target=img.jp2&cnew=http").await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, _) = get(router, "/jpip?target=img.jp2&cnew=http").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(header(&headers, "Retry-After"), Some("1"));
}

#[tokio::test]
async fn test_health_endpoint() {
    let router = create_router(app_state().await);
    let (status, _, body) = get(router, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["registered_targets"], 1);
}

#[tokio::test]
async fn test_stats_endpoint_accumulates() {
    let state = app_state().await;
    let router = create_router(state);

    get(router.clone(), "/jpip?target=img.jp2&cnew=http").await;
    let (status, _, body) = get(router, "/stats").await;
    assert_eq!(status, StatusCode::OK);

    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["engine"]["requests_received"], 1);
    assert_eq!(stats["engine"]["active_sessions"], 1);
}

#[tokio::test]
async fn test_ws_upgrade_requires_websocket_headers() {
    let router = create_router(app_state().await);
    // Plain GET without upgrade headers.
    let (status, _, _) = get(router, "/ws").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stopped_engine_answers_503() {
    let state = app_state().await;
    state.engine.stop();
    let router = create_router(state);

    let (status, _, _) = get(router, "/jpip?target=img.jp2&cnew=http").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

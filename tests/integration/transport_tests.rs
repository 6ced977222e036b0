//! Frame protocol tests over an in-memory channel.
//!
//! A task drives the server request engine off one end of a duplex
//! channel; the multiplexed client runs against the other end, exactly as
//! it would over a real WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use jpip_streamer::codestream::{BinClass, DataBin, MarkerCodestream};
use jpip_streamer::error::TransportError;
use jpip_streamer::request::ViewWindowRequest;
use jpip_streamer::server::{parse_cnew_cid, RequestEngine};
use jpip_streamer::transport::{
    duplex_pair, ClientConfig, DuplexChannel, Frame, FrameChannel, FrameType, JpipClient,
    ResponsePayload,
};

use super::test_utils::engine_with_sample;

struct OneShotFactory {
    channel: std::sync::Mutex<Option<DuplexChannel>>,
}

#[async_trait]
impl jpip_streamer::transport::FrameChannelFactory for OneShotFactory {
    async fn connect(&self, _url: &str) -> Result<Box<dyn FrameChannel>, TransportError> {
        self.channel
            .lock()
            .unwrap()
            .take()
            .map(|c| Box::new(c) as Box<dyn FrameChannel>)
            .ok_or_else(|| TransportError::Network("no channel".to_string()))
    }
}

/// Serve the engine over the remote end of a duplex channel.
fn spawn_frame_server(remote: DuplexChannel, engine: Arc<RequestEngine<MarkerCodestream>>) {
    tokio::spawn(async move {
        while let Some(bytes) = remote.recv().await {
            let Ok(frame) = Frame::decode(&bytes) else {
                break;
            };
            let reply = match frame.frame_type {
                FrameType::Request => {
                    let Ok(request) = frame.decode_request() else {
                        continue;
                    };
                    match engine.handle_request(request, "ws-test").await {
                        Ok(response) => Frame::response(
                            frame.request_id,
                            &ResponsePayload {
                                status: response.status,
                                headers: response.headers,
                                body: response.body,
                            },
                        ),
                        Err(e) => Frame::error(frame.request_id, &e.to_string()),
                    }
                }
                FrameType::Ping => Frame::pong(frame.payload),
                _ => continue,
            };
            if remote.send(reply.encode()).await.is_err() {
                break;
            }
        }
    });
}

async fn client_against_engine(
    engine: Arc<RequestEngine<MarkerCodestream>>,
) -> JpipClient {
    let (local, remote) = duplex_pair();
    spawn_frame_server(remote, engine);

    let config = ClientConfig {
        fallback_enabled: false,
        ..Default::default()
    };
    let mut client = JpipClient::new(
        config,
        Box::new(OneShotFactory {
            channel: std::sync::Mutex::new(Some(local)),
        }),
    );
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_channel_creation_over_frames() {
    let engine = engine_with_sample().await;
    let mut client = client_against_engine(engine).await;

    let response = client
        .send_request(&ViewWindowRequest::for_target("img.jp2").with_new_channel("ws"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    let cnew = response.header("JPIP-cnew").unwrap();
    assert!(parse_cnew_cid(cnew).is_some());
}

#[tokio::test]
async fn test_full_streaming_session_over_frames() {
    let engine = engine_with_sample().await;
    let mut client = client_against_engine(engine).await;

    // Create the channel, then pull data over it into a client session.
    let created = client
        .send_request(&ViewWindowRequest::for_target("img.jp2").with_new_channel("ws"))
        .await
        .unwrap();
    let cid = parse_cnew_cid(created.header("JPIP-cnew").unwrap()).unwrap();

    let mut session = jpip_streamer::session::ClientSession::create();
    session.bind_channel(&cid, "img.jp2").unwrap();

    let mut request = ViewWindowRequest::for_target("img.jp2");
    request.channel_id = Some(cid);
    let response = client.send_request(&request).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(!response.body.is_empty());

    // The body is raw bin bytes; ingest it as one tile-class unit.
    session
        .ingest_bin(DataBin::new(BinClass::Tile, 0, response.body.to_vec()))
        .unwrap();
    assert_eq!(session.stats().bins_received, 1);
    assert!(session.has_bin(BinClass::Tile, 0));
}

#[tokio::test]
async fn test_server_error_propagates_as_error_frame() {
    let engine = engine_with_sample().await;
    let mut client = client_against_engine(engine).await;

    let result = client
        .send_request(&ViewWindowRequest::for_target("ghost.jp2").with_new_channel("ws"))
        .await;
    match result {
        Err(TransportError::Server(message)) => {
            assert!(message.contains("ghost.jp2"));
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_keepalive_over_frames() {
    let engine = engine_with_sample().await;
    let mut client = client_against_engine(engine).await;

    client.send_ping().await.unwrap();
    client
        .poll_incoming(std::time::Duration::from_millis(200))
        .await
        .unwrap();
    assert!(client.last_rtt().is_some());
}

#[tokio::test]
async fn test_pushed_bins_reach_client_cache() {
    let (local, remote) = duplex_pair();
    let config = ClientConfig {
        fallback_enabled: false,
        ..Default::default()
    };
    let mut client = JpipClient::new(
        config,
        Box::new(OneShotFactory {
            channel: std::sync::Mutex::new(Some(local)),
        }),
    );
    client.connect().await.unwrap();

    // Server pushes two bins unprompted.
    let bin_a = DataBin::new(BinClass::Precinct, 9, vec![1, 2, 3]);
    let bin_b = DataBin::new(BinClass::Tile, 3, vec![4, 5]);
    remote.send(Frame::push(&bin_a).encode()).await.unwrap();
    remote.send(Frame::push(&bin_b).encode()).await.unwrap();

    client
        .poll_incoming(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    client
        .poll_incoming(std::time::Duration::from_millis(100))
        .await
        .unwrap();

    let mut session = jpip_streamer::session::ClientSession::create();
    for bin in client.take_data_bins() {
        session.ingest_bin(bin).unwrap();
    }
    assert!(session.has_bin(BinClass::Precinct, 9));
    assert!(session.has_bin(BinClass::Tile, 3));
}

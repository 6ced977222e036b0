//! Multiplexed JPIP client transport.
//!
//! The client assigns monotonically increasing request ids starting at 1
//! and correlates responses and errors by id. Frames for other outstanding
//! requests are parked until their caller claims them; data-bin and push
//! frames go to an inbound queue; pongs close the RTT measurement loop.
//!
//! Connection loss triggers exponential-backoff reconnection with jitter.
//! When the initial connect fails and fallback is enabled, the client
//! rewrites the URL scheme to HTTP and satisfies requests over the HTTP
//! channel for the remainder of its lifetime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::codestream::DataBin;
use crate::error::TransportError;
use crate::geometry::Viewport;
use crate::request::ViewWindowRequest;

use super::channel::{FrameChannel, FrameChannelFactory, HttpChannel};
use super::frame::{Frame, FrameType, ResponsePayload};

/// Reconnection backoff parameters.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Symmetric jitter as a fraction of the delay
    pub jitter_factor: f64,

    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

/// Backoff delay before reconnect `attempt` (0-based), without jitter.
pub fn base_backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let raw = config.initial_delay.as_secs_f64() * config.multiplier.powi(attempt as i32);
    Duration::from_secs_f64(raw.min(config.max_delay.as_secs_f64()))
}

/// Backoff delay with symmetric jitter applied.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let base = base_backoff_delay(config, attempt).as_secs_f64();
    if config.jitter_factor <= 0.0 {
        return Duration::from_secs_f64(base);
    }
    let jitter = rand::thread_rng().gen_range(-config.jitter_factor..=config.jitter_factor);
    Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
}

/// Client transport configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws://` or `wss://`
    pub url: String,

    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub connection_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub reconnect: ReconnectConfig,
    pub fallback_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/ws".to_string(),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(60),
            max_concurrent_requests: 32,
            reconnect: ReconnectConfig::default(),
            fallback_enabled: true,
        }
    }
}

/// Rewrite a `ws://`/`wss://` URL to its HTTP fallback counterpart.
pub fn fallback_url(ws_url: &str) -> String {
    if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        ws_url.to_string()
    }
}

#[derive(Debug)]
struct PendingRequest {
    viewport: Option<Viewport>,
    sent_at: Instant,
}

/// Counters the client accumulates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub bins_received: u64,
    pub pushes_received: u64,
    pub reconnects: u64,
    pub requests_cancelled: u64,
}

/// The multiplexed client.
pub struct JpipClient {
    config: ClientConfig,
    factory: Box<dyn FrameChannelFactory>,
    http: Option<Box<dyn HttpChannel>>,
    channel: Option<Box<dyn FrameChannel>>,
    http_fallback_active: bool,
    next_request_id: u32,
    pending: HashMap<u32, PendingRequest>,
    parked: HashMap<u32, Result<ResponsePayload, TransportError>>,
    cancelled: HashSet<u32>,
    inbound_bins: VecDeque<DataBin>,
    last_ping_sent: Option<Instant>,
    last_rtt: Option<Duration>,
    last_activity: Instant,
    cancel_reconnect: Arc<Notify>,
    stats: ClientStats,
}

impl JpipClient {
    pub fn new(config: ClientConfig, factory: Box<dyn FrameChannelFactory>) -> Self {
        Self {
            config,
            factory,
            http: None,
            channel: None,
            http_fallback_active: false,
            next_request_id: 1,
            pending: HashMap::new(),
            parked: HashMap::new(),
            cancelled: HashSet::new(),
            inbound_bins: VecDeque::new(),
            last_ping_sent: None,
            last_rtt: None,
            last_activity: Instant::now(),
            cancel_reconnect: Arc::new(Notify::new()),
            stats: ClientStats::default(),
        }
    }

    /// Attach the HTTP channel used by the fallback path.
    pub fn with_http_channel(mut self, http: Box<dyn HttpChannel>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_using_fallback(&self) -> bool {
        self.http_fallback_active
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Most recent keepalive round-trip time.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Whether the connection has been quiet past the connection timeout.
    pub fn is_stale(&self) -> bool {
        self.last_activity.elapsed() > self.config.connection_timeout
    }

    /// Handle that cancels an in-flight reconnection wait.
    pub fn cancel_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.cancel_reconnect)
    }

    /// Connect once. On failure with fallback enabled, switches to HTTP for
    /// the remainder of the client lifetime.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Err(TransportError::InvalidState(
                "already connected".to_string(),
            ));
        }
        if self.http_fallback_active {
            return Ok(());
        }

        match self.factory.connect(&self.config.url).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.last_activity = Instant::now();
                info!(url = %self.config.url, "connected");
                Ok(())
            }
            Err(e) if self.config.fallback_enabled && self.http.is_some() => {
                warn!(error = %e, "WebSocket connect failed, falling back to HTTP");
                self.http_fallback_active = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reconnect with exponential backoff until connected, cancelled, or
    /// out of attempts. A successful reconnect resets the attempt count.
    pub async fn connect_with_retry(&mut self) -> Result<(), TransportError> {
        if !self.config.reconnect.enabled {
            return self.connect().await;
        }

        let mut attempt = 0u32;
        loop {
            match self.factory.connect(&self.config.url).await {
                Ok(channel) => {
                    self.channel = Some(channel);
                    self.last_activity = Instant::now();
                    self.stats.reconnects += 1;
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.config.reconnect.max_attempts {
                        return Err(TransportError::MaxReconnectAttempts {
                            attempts: self.config.reconnect.max_attempts,
                        });
                    }
                    let delay = backoff_delay(&self.config.reconnect, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "reconnect backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel_reconnect.notified() => {
                            return Err(TransportError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Close the connection, failing every pending request.
    pub async fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        for (id, _) in self.pending.drain() {
            self.parked.insert(id, Err(TransportError::ConnectionClosed));
        }
    }

    /// Register and send one request, returning its id.
    pub async fn begin_request(
        &mut self,
        request: &ViewWindowRequest,
    ) -> Result<u32, TransportError> {
        self.begin_request_for_viewport(request, None).await
    }

    /// Like [`begin_request`](Self::begin_request), remembering the
    /// viewport the request serves so stale requests can be cancelled.
    pub async fn begin_request_for_viewport(
        &mut self,
        request: &ViewWindowRequest,
        viewport: Option<Viewport>,
    ) -> Result<u32, TransportError> {
        if self.channel.is_none() {
            return Err(TransportError::NotConnected);
        }
        if self.pending.len() >= self.config.max_concurrent_requests {
            return Err(TransportError::TooManyRequests {
                max: self.config.max_concurrent_requests,
            });
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let encoded = Frame::request(request_id, request).encode();
        if let Some(channel) = self.channel.as_ref() {
            channel.send(encoded).await?;
        }

        self.pending.insert(
            request_id,
            PendingRequest {
                viewport,
                sent_at: Instant::now(),
            },
        );
        self.stats.requests_sent += 1;
        Ok(request_id)
    }

    /// Wait for the response correlated to `request_id`.
    pub async fn await_response(
        &mut self,
        request_id: u32,
    ) -> Result<ResponsePayload, TransportError> {
        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        loop {
            if self.cancelled.remove(&request_id) {
                return Err(TransportError::Cancelled);
            }
            if let Some(result) = self.parked.remove(&request_id) {
                return result;
            }
            if !self.pending.contains_key(&request_id) && !self.parked.contains_key(&request_id) {
                return Err(TransportError::InvalidState(format!(
                    "request {request_id} is not outstanding"
                )));
            }

            let channel = self.channel.as_ref().ok_or(TransportError::NotConnected)?;
            let frame_bytes =
                match tokio::time::timeout_at(deadline, channel.recv()).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        self.pending.remove(&request_id);
                        return Err(TransportError::ConnectionClosed);
                    }
                    Err(_) => {
                        self.pending.remove(&request_id);
                        return Err(TransportError::Timeout {
                            timeout_ms: self.config.request_timeout.as_millis() as u64,
                        });
                    }
                };
            self.handle_frame_bytes(frame_bytes).await?;
        }
    }

    /// Send a request and wait for its response.
    pub async fn send_request(
        &mut self,
        request: &ViewWindowRequest,
    ) -> Result<ResponsePayload, TransportError> {
        if self.http_fallback_active {
            return self.send_request_http(request).await;
        }
        let request_id = self.begin_request(request).await?;
        self.await_response(request_id).await
    }

    async fn send_request_http(
        &mut self,
        request: &ViewWindowRequest,
    ) -> Result<ResponsePayload, TransportError> {
        let http = self.http.as_ref().ok_or(TransportError::NotConnected)?;
        let url = format!("{}/?{}", fallback_url(&self.config.url), request.to_query());
        let response = http.get(&url).await?;
        self.stats.requests_sent += 1;
        self.stats.responses_received += 1;
        self.last_activity = Instant::now();
        Ok(ResponsePayload {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    /// Send a keepalive ping and note the send time for RTT measurement.
    pub async fn send_ping(&mut self) -> Result<(), TransportError> {
        let channel = self.channel.as_ref().ok_or(TransportError::NotConnected)?;
        self.last_ping_sent = Some(Instant::now());
        channel.send(Frame::ping(Bytes::new()).encode()).await
    }

    /// Drain one incoming frame if one is ready within `wait`.
    pub async fn poll_incoming(&mut self, wait: Duration) -> Result<bool, TransportError> {
        let channel = self.channel.as_ref().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(wait, channel.recv()).await {
            Ok(Some(bytes)) => {
                self.handle_frame_bytes(bytes).await?;
                Ok(true)
            }
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Ok(false),
        }
    }

    /// Take every data bin received so far.
    pub fn take_data_bins(&mut self) -> Vec<DataBin> {
        self.inbound_bins.drain(..).collect()
    }

    /// Cancel pending requests whose viewport no longer intersects the new
    /// one. Their responses, if they ever arrive, are discarded.
    pub fn update_viewport(&mut self, viewport: &Viewport) -> usize {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                p.viewport.is_some_and(|vp| {
                    !viewport.intersects(vp.x, vp.y, vp.width, vp.height)
                })
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.pending.remove(id);
            self.cancelled.insert(*id);
            self.stats.requests_cancelled += 1;
        }
        stale.len()
    }

    async fn handle_frame_bytes(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        self.last_activity = Instant::now();
        let frame = Frame::decode(&bytes)?;
        match frame.frame_type {
            FrameType::Response => {
                if self.cancelled.remove(&frame.request_id) {
                    debug!(request_id = frame.request_id, "discarding cancelled response");
                    return Ok(());
                }
                if self.pending.remove(&frame.request_id).is_some() {
                    self.stats.responses_received += 1;
                    self.parked
                        .insert(frame.request_id, frame.decode_response().map_err(Into::into));
                }
            }
            FrameType::Error => {
                if self.cancelled.remove(&frame.request_id) {
                    return Ok(());
                }
                if self.pending.remove(&frame.request_id).is_some() {
                    let message = String::from_utf8_lossy(&frame.payload).into_owned();
                    self.parked
                        .insert(frame.request_id, Err(TransportError::Server(message)));
                }
            }
            FrameType::DataBin => {
                self.inbound_bins.push_back(frame.decode_data_bin()?);
                self.stats.bins_received += 1;
            }
            FrameType::Push => {
                self.inbound_bins.push_back(frame.decode_data_bin()?);
                self.stats.pushes_received += 1;
            }
            FrameType::Ping => {
                if let Some(channel) = self.channel.as_ref() {
                    channel.send(Frame::pong(frame.payload).encode()).await?;
                }
            }
            FrameType::Pong => {
                if let Some(sent_at) = self.last_ping_sent.take() {
                    self.last_rtt = Some(sent_at.elapsed());
                }
            }
            FrameType::Control | FrameType::Request => {
                debug!(frame_type = ?frame.frame_type, "ignoring unexpected frame");
            }
        }
        Ok(())
    }

    /// Ages of every outstanding request, for timeout sweeps by the host.
    pub fn pending_ages(&self) -> Vec<(u32, Duration)> {
        self.pending
            .iter()
            .map(|(id, p)| (*id, p.sent_at.elapsed()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::BinClass;
    use crate::transport::channel::{duplex_pair, DuplexChannel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Factory that hands out pre-built channel ends, failing when empty.
    struct ScriptedFactory {
        channels: StdMutex<Vec<DuplexChannel>>,
        connect_calls: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new(channels: Vec<DuplexChannel>) -> Self {
            Self {
                channels: StdMutex::new(channels),
                connect_calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl FrameChannelFactory for ScriptedFactory {
        async fn connect(&self, _url: &str) -> Result<Box<dyn FrameChannel>, TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            match self.channels.lock().unwrap().pop() {
                Some(channel) => Ok(Box::new(channel)),
                None => Err(TransportError::Network("connection refused".to_string())),
            }
        }
    }

    fn quick_config() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(500),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(1),
                max_attempts: 3,
                jitter_factor: 0.0,
                ..Default::default()
            },
            fallback_enabled: false,
            ..Default::default()
        }
    }

    async fn connected_client() -> (JpipClient, DuplexChannel) {
        let (local, remote) = duplex_pair();
        let mut client = JpipClient::new(
            quick_config(),
            Box::new(ScriptedFactory::new(vec![local])),
        );
        client.connect().await.unwrap();
        (client, remote)
    }

    /// Echo server: answers every request frame with a 200 response whose
    /// body is the request id as text.
    fn spawn_echo_server(remote: DuplexChannel) {
        tokio::spawn(async move {
            while let Some(bytes) = remote.recv().await {
                let frame = Frame::decode(&bytes).unwrap();
                match frame.frame_type {
                    FrameType::Request => {
                        let payload = ResponsePayload::ok(frame.request_id.to_string());
                        let reply = Frame::response(frame.request_id, &payload);
                        if remote.send(reply.encode()).await.is_err() {
                            break;
                        }
                    }
                    FrameType::Ping => {
                        let reply = Frame::pong(frame.payload);
                        if remote.send(reply.encode()).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    #[test]
    fn test_backoff_delays() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let delays: Vec<u64> = (0..5)
            .map(|attempt| base_backoff_delay(&config, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);

        // Capped at max_delay.
        assert_eq!(base_backoff_delay(&config, 10).as_secs(), 60);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(10),
            multiplier: 1.0,
            jitter_factor: 0.2,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = backoff_delay(&config, 0).as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_fallback_url_rewrite() {
        assert_eq!(fallback_url("ws://host:1/ws"), "http://host:1/ws");
        assert_eq!(fallback_url("wss://host/ws"), "https://host/ws");
        assert_eq!(fallback_url("http://host"), "http://host");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (mut client, remote) = connected_client().await;
        spawn_echo_server(remote);

        let response = client
            .send_request(&ViewWindowRequest::for_target("a.jp2"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"1");

        // Ids increase monotonically from 1.
        let response = client
            .send_request(&ViewWindowRequest::for_target("a.jp2"))
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_parked() {
        let (mut client, remote) = connected_client().await;

        let first = client
            .begin_request(&ViewWindowRequest::for_target("a"))
            .await
            .unwrap();
        let second = client
            .begin_request(&ViewWindowRequest::for_target("b"))
            .await
            .unwrap();

        // Server answers second first.
        remote.recv().await.unwrap();
        remote.recv().await.unwrap();
        remote
            .send(Frame::response(second, &ResponsePayload::ok("two")).encode())
            .await
            .unwrap();
        remote
            .send(Frame::response(first, &ResponsePayload::ok("one")).encode())
            .await
            .unwrap();

        // Awaiting the first parks the second until claimed.
        let response = client.await_response(first).await.unwrap();
        assert_eq!(response.body.as_ref(), b"one");
        let response = client.await_response(second).await.unwrap();
        assert_eq!(response.body.as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_concurrent_request_limit() {
        let (local, _remote) = duplex_pair();
        let mut config = quick_config();
        config.max_concurrent_requests = 2;
        let mut client =
            JpipClient::new(config, Box::new(ScriptedFactory::new(vec![local])));
        client.connect().await.unwrap();

        client
            .begin_request(&ViewWindowRequest::for_target("a"))
            .await
            .unwrap();
        client
            .begin_request(&ViewWindowRequest::for_target("b"))
            .await
            .unwrap();
        let third = client.begin_request(&ViewWindowRequest::for_target("c")).await;
        assert!(matches!(
            third,
            Err(TransportError::TooManyRequests { max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (mut client, _remote) = connected_client().await;
        let result = client
            .send_request(&ViewWindowRequest::for_target("never-answered"))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_frame_fails_request() {
        let (mut client, remote) = connected_client().await;
        tokio::spawn(async move {
            let bytes = remote.recv().await.unwrap();
            let frame = Frame::decode(&bytes).unwrap();
            remote
                .send(Frame::error(frame.request_id, "unknown target").encode())
                .await
                .unwrap();
        });

        let result = client
            .send_request(&ViewWindowRequest::for_target("ghost"))
            .await;
        match result {
            Err(TransportError::Server(message)) => assert_eq!(message, "unknown target"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_data_bins_and_pushes_queue() {
        let (mut client, remote) = connected_client().await;

        let bin = DataBin::new(BinClass::Precinct, 7, vec![1, 2, 3]);
        remote.send(Frame::data_bin(&bin).encode()).await.unwrap();
        remote.send(Frame::push(&bin).encode()).await.unwrap();

        client.poll_incoming(Duration::from_millis(100)).await.unwrap();
        client.poll_incoming(Duration::from_millis(100)).await.unwrap();

        let bins = client.take_data_bins();
        assert_eq!(bins.len(), 2);
        assert_eq!(client.stats().bins_received, 1);
        assert_eq!(client.stats().pushes_received, 1);
        assert!(client.take_data_bins().is_empty());
    }

    #[tokio::test]
    async fn test_ping_pong_rtt() {
        let (mut client, remote) = connected_client().await;
        spawn_echo_server(remote);

        assert!(client.last_rtt().is_none());
        client.send_ping().await.unwrap();
        client.poll_incoming(Duration::from_millis(200)).await.unwrap();
        assert!(client.last_rtt().is_some());
    }

    #[tokio::test]
    async fn test_peer_ping_gets_pong() {
        let (mut client, remote) = connected_client().await;

        remote
            .send(Frame::ping(Bytes::from_static(b"echo-me")).encode())
            .await
            .unwrap();
        client.poll_incoming(Duration::from_millis(100)).await.unwrap();

        let reply = Frame::decode(&remote.recv().await.unwrap()).unwrap();
        assert_eq!(reply.frame_type, FrameType::Pong);
        assert_eq!(reply.payload.as_ref(), b"echo-me");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let (mut client, _remote) = connected_client().await;
        let id = client
            .begin_request(&ViewWindowRequest::for_target("a"))
            .await
            .unwrap();

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(matches!(
            client.await_response(id).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_exhausts_attempts() {
        let mut client = JpipClient::new(quick_config(), Box::new(ScriptedFactory::failing()));
        let result = client.connect_with_retry().await;
        assert!(matches!(
            result,
            Err(TransportError::MaxReconnectAttempts { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_cancellation_surfaces_promptly() {
        let mut config = quick_config();
        config.reconnect.initial_delay = Duration::from_secs(30);
        config.reconnect.max_attempts = 5;
        let mut client = JpipClient::new(config, Box::new(ScriptedFactory::failing()));

        let cancel = client.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.notify_waiters();
        });

        let started = Instant::now();
        let result = client.connect_with_retry().await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_http_fallback_is_sticky() {
        struct RecordingHttp {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl HttpChannel for RecordingHttp {
            async fn get(&self, url: &str) -> Result<super::super::channel::HttpResponse, TransportError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                assert!(url.starts_with("http://"));
                Ok(super::super::channel::HttpResponse {
                    status: 200,
                    headers: vec![("Content-Type".to_string(), "application/octet-stream".to_string())],
                    body: Bytes::from_static(b"fallback"),
                })
            }
        }

        let mut config = quick_config();
        config.fallback_enabled = true;
        let mut client = JpipClient::new(config, Box::new(ScriptedFactory::failing()))
            .with_http_channel(Box::new(RecordingHttp {
                calls: AtomicUsize::new(0),
            }));

        client.connect().await.unwrap();
        assert!(client.is_using_fallback());
        assert!(!client.is_connected());

        let response = client
            .send_request(&ViewWindowRequest::for_target("a.jp2"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"fallback");

        // Still on HTTP for subsequent requests.
        client
            .send_request(&ViewWindowRequest::for_target("b.jp2"))
            .await
            .unwrap();
        assert!(client.is_using_fallback());
    }

    #[tokio::test]
    async fn test_viewport_update_cancels_stale_requests() {
        let (mut client, remote) = connected_client().await;

        let stale_vp = Viewport::new(0, 0, 100, 100, 0);
        let live_vp = Viewport::new(500, 500, 100, 100, 0);
        let stale_id = client
            .begin_request_for_viewport(&ViewWindowRequest::for_target("a"), Some(stale_vp))
            .await
            .unwrap();
        let live_id = client
            .begin_request_for_viewport(&ViewWindowRequest::for_target("b"), Some(live_vp))
            .await
            .unwrap();

        // New viewport overlaps only the second request.
        let cancelled = client.update_viewport(&Viewport::new(450, 450, 200, 200, 0));
        assert_eq!(cancelled, 1);
        assert_eq!(client.pending_count(), 1);

        // The stale response is discarded on receipt.
        remote
            .send(Frame::response(stale_id, &ResponsePayload::ok("stale")).encode())
            .await
            .unwrap();
        remote
            .send(Frame::response(live_id, &ResponsePayload::ok("live")).encode())
            .await
            .unwrap();

        let response = client.await_response(live_id).await.unwrap();
        assert_eq!(response.body.as_ref(), b"live");
        assert!(matches!(
            client.await_response(stale_id).await,
            Err(TransportError::InvalidState(_))
        ));
        assert_eq!(client.stats().requests_cancelled, 1);
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let mut client =
            JpipClient::new(quick_config(), Box::new(ScriptedFactory::failing()));
        assert!(matches!(
            client.begin_request(&ViewWindowRequest::for_target("a")).await,
            Err(TransportError::NotConnected)
        ));
    }
}

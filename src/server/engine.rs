//! The server request engine.
//!
//! Orchestrates one request end to end: admission through the priority
//! queue, session resolution or creation, the bandwidth-throttle probe,
//! and dispatch into one of three paths (channel creation, metadata, data
//! bins). Data-bin dispatch filters against the session's sent-bin record
//! so a channel never receives the same bin twice, transcoding on the fly
//! when the requested coding mode differs from the stored stream.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::fnv1a64;
use crate::codestream::{BinClass, CodestreamFormat, CodestreamSource, DataBin, TranscodeDirection};
use crate::error::{ProtocolError, ServerError};
use crate::request::ViewWindowRequest;
use crate::session::ServerSessionRegistry;

use super::queue::{derive_priority, RequestQueue};
use super::throttle::{BandwidthThrottle, ThrottleConfig};

/// Estimated response cost charged against the throttle before dispatch.
const RESPONSE_BYTE_BUDGET: u64 = 1024;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Request queue capacity
    pub queue_capacity: usize,

    /// Sessions idle past this are expired by the health sweep
    pub session_timeout: Duration,

    /// Transcoded-stream cache entries
    pub transcode_cache_entries: usize,

    pub throttle: ThrottleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            session_timeout: Duration::from_secs(300),
            transcode_cache_entries: 64,
            throttle: ThrottleConfig::default(),
        }
    }
}

/// One registered image.
struct TargetEntry {
    bytes: Bytes,
    format: CodestreamFormat,
    bins: Vec<DataBin>,
}

/// Status, headers and body the engine answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl EngineResponse {
    fn ok(body: Bytes) -> Self {
        Self {
            status: 200,
            headers: vec![(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            )],
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EngineStats {
    pub requests_received: u64,
    pub requests_rejected: u64,
    pub bytes_sent: u64,
    pub active_sessions: usize,
    pub registered_targets: usize,
    pub queue_depth: usize,
    pub queue_dropped: u64,
}

/// The request engine, shared across connections behind an `Arc`.
pub struct RequestEngine<S: CodestreamSource> {
    source: S,
    config: EngineConfig,
    running: AtomicBool,
    targets: RwLock<HashMap<String, TargetEntry>>,
    sessions: RwLock<ServerSessionRegistry>,
    queue: Mutex<RequestQueue>,
    throttle: Mutex<BandwidthThrottle>,
    transcode_cache: Mutex<LruCache<(u64, TranscodeDirection), Bytes>>,
    requests_received: AtomicU64,
    requests_rejected: AtomicU64,
    bytes_sent: AtomicU64,
}

impl<S: CodestreamSource> RequestEngine<S> {
    pub fn new(source: S, config: EngineConfig) -> Self {
        let queue = RequestQueue::new(config.queue_capacity);
        let throttle = BandwidthThrottle::new(config.throttle.clone());
        let cache_entries = NonZeroUsize::new(config.transcode_cache_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            config,
            running: AtomicBool::new(true),
            targets: RwLock::new(HashMap::new()),
            sessions: RwLock::new(ServerSessionRegistry::new()),
            queue: Mutex::new(queue),
            throttle: Mutex::new(throttle),
            transcode_cache: Mutex::new(LruCache::new(cache_entries)),
            requests_received: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Register an image under a target name.
    pub async fn register_target(
        &self,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Result<(), ServerError> {
        let name = name.into();
        let bytes = bytes.into();
        let format = self.source.classify(&bytes).await?;
        let bins = self.source.extract_data_bins(&bytes).await?;
        info!(target = %name, bins = bins.len(), format = ?format, "target registered");
        self.targets.write().await.insert(
            name,
            TargetEntry {
                bytes,
                format,
                bins,
            },
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle one request for the client identified by `client_key`.
    pub async fn handle_request(
        &self,
        request: ViewWindowRequest,
        client_key: &str,
    ) -> Result<EngineResponse, ServerError> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        self.requests_received.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = request.validate() {
            self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        // Admission through the priority queue; the dequeued request is the
        // one processed, so urgent arrivals overtake queued bulk work.
        let queued = {
            let mut queue = self.queue.lock().await;
            let priority = derive_priority(&request);
            queue.enqueue(request, priority).map_err(|e| {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                e
            })?;
            match queue.dequeue() {
                Some(item) => item.request,
                None => {
                    return Err(ServerError::Session(
                        crate::error::SessionError::InvalidState(
                            "queue empty after enqueue".to_string(),
                        ),
                    ))
                }
            }
        };

        // Resolve or create the session.
        let (channel_id, created) = {
            let mut sessions = self.sessions.write().await;
            let known = queued
                .channel_id
                .as_deref()
                .map(|cid| sessions.get(cid).is_some())
                .unwrap_or(false);
            if known {
                let cid = queued.channel_id.clone().unwrap_or_default();
                if let Some(session) = sessions.get_mut(&cid) {
                    session.record_request();
                }
                (cid, false)
            } else if queued.wants_new_channel() {
                let target =
                    queued
                        .target
                        .clone()
                        .ok_or(ServerError::Protocol(ProtocolError::InvalidParameter {
                            field: "target",
                            message: "channel creation requires a target".to_string(),
                        }))?;
                let session = sessions.create(target);
                (session.channel_id().to_string(), true)
            } else {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ServerError::Protocol(ProtocolError::InvalidParameter {
                    field: "cid",
                    message: "no known channel and no cnew".to_string(),
                }));
            }
        };

        // Bandwidth probe before any bytes are produced.
        {
            let mut throttle = self.throttle.lock().await;
            if !throttle.can_send(client_key, RESPONSE_BYTE_BUDGET) {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ServerError::Throttled {
                    retry_after_secs: 1,
                });
            }
        }

        let response = if created {
            self.dispatch_channel_created(&queued, &channel_id).await?
        } else if queued.metadata_only {
            self.dispatch_metadata(&queued, &channel_id).await?
        } else {
            self.dispatch_data(&queued, &channel_id).await?
        };

        let sent = response.body.len() as u64;
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.throttle.lock().await.record_sent(client_key, sent);
        Ok(response)
    }

    async fn dispatch_channel_created(
        &self,
        request: &ViewWindowRequest,
        channel_id: &str,
    ) -> Result<EngineResponse, ServerError> {
        let target_name = request.target.clone().unwrap_or_default();
        let targets = self.targets.read().await;
        let entry = targets
            .get(&target_name)
            .ok_or_else(|| ServerError::UnknownTarget(target_name.clone()))?;

        let mut response = EngineResponse::ok(Bytes::new());
        response.headers.push((
            "JPIP-cnew".to_string(),
            format!("cid={channel_id},path=/jpip,transport=http"),
        ));
        response
            .headers
            .push(("JPIP-tid".to_string(), target_name.clone()));
        response
            .headers
            .push(("JPIP-cap".to_string(), entry.format.capability().to_string()));
        response
            .headers
            .push(("JPIP-pref".to_string(), entry.format.capability().to_string()));
        Ok(response)
    }

    async fn dispatch_metadata(
        &self,
        request: &ViewWindowRequest,
        channel_id: &str,
    ) -> Result<EngineResponse, ServerError> {
        let target_name = self.effective_target(request, channel_id).await?;
        let targets = self.targets.read().await;
        let entry = targets
            .get(&target_name)
            .ok_or_else(|| ServerError::UnknownTarget(target_name.clone()))?;

        let mut body = BytesMut::new();
        for bin in entry.bins.iter().filter(|b| b.class == BinClass::Metadata) {
            body.extend_from_slice(&bin.bytes);
        }
        Ok(EngineResponse::ok(body.freeze()))
    }

    async fn dispatch_data(
        &self,
        request: &ViewWindowRequest,
        channel_id: &str,
    ) -> Result<EngineResponse, ServerError> {
        let target_name = self.effective_target(request, channel_id).await?;

        // Collect candidate bins under the targets lock, then transcode and
        // filter without holding it.
        let (mut bins, raw_bytes, format) = {
            let targets = self.targets.read().await;
            let entry = targets
                .get(&target_name)
                .ok_or_else(|| ServerError::UnknownTarget(target_name.clone()))?;
            (entry.bins.clone(), entry.bytes.clone(), entry.format)
        };

        // Transcode when the preference names the other coding mode. A
        // failed transcode serves the original bytes unchanged.
        if let Some(direction) = transcode_direction(request.preference.as_deref(), format) {
            for bin in &mut bins {
                bin.bytes = self.transcode_cached(&bin.bytes, direction).await;
            }
        }

        let mut body = BytesMut::new();
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions.resolve(channel_id)?;
            let mut appended = 0usize;
            for bin in &bins {
                if session.has_data_bin(bin.class, bin.id) {
                    continue;
                }
                body.extend_from_slice(&bin.bytes);
                session.record_sent_data_bin(bin);
                appended += 1;
            }
            if appended == 0 {
                // Everything was already delivered: answer with the raw
                // stream rather than an empty body.
                debug!(channel_id = %channel_id, "all bins filtered, serving raw bytes");
                body.extend_from_slice(&raw_bytes);
            }
        }

        let mut body = body.freeze();
        if let Some(limit) = request.max_length {
            if (body.len() as u64) > limit {
                body = body.slice(..limit as usize);
            }
        }
        Ok(EngineResponse::ok(body))
    }

    async fn effective_target(
        &self,
        request: &ViewWindowRequest,
        channel_id: &str,
    ) -> Result<String, ServerError> {
        if let Some(target) = &request.target {
            return Ok(target.clone());
        }
        let sessions = self.sessions.read().await;
        sessions
            .get(channel_id)
            .map(|s| s.target().to_string())
            .ok_or_else(|| crate::error::SessionError::UnknownChannel(channel_id.to_string()).into())
    }

    async fn transcode_cached(&self, bytes: &Bytes, direction: TranscodeDirection) -> Bytes {
        let key = (fnv1a64(bytes), direction);
        {
            let mut cache = self.transcode_cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }
        match self.source.transcode(bytes, direction).await {
            Ok(transcoded) => {
                self.transcode_cache
                    .lock()
                    .await
                    .put(key, transcoded.clone());
                transcoded
            }
            Err(e) => {
                warn!(error = %e, "transcode failed, serving original bytes");
                bytes.clone()
            }
        }
    }

    /// Close one channel and its session.
    pub async fn close_channel(&self, channel_id: &str) -> bool {
        self.sessions.write().await.remove(channel_id).is_some()
    }

    /// Expire sessions idle past the configured timeout.
    pub async fn expire_idle_sessions(&self) -> usize {
        self.sessions
            .write()
            .await
            .expire_idle(self.config.session_timeout)
    }

    /// Remove every queued request for a target. Returns the number removed.
    pub async fn cancel_target_requests(&self, target: &str) -> usize {
        self.queue.lock().await.remove_for_target(target)
    }

    pub async fn stats(&self) -> EngineStats {
        let queue = self.queue.lock().await;
        EngineStats {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
            registered_targets: self.targets.read().await.len(),
            queue_depth: queue.len(),
            queue_dropped: queue.dropped(),
        }
    }

    /// Bins extracted for a target, for the push subsystem.
    pub async fn target_bins(&self, target: &str) -> Option<Vec<DataBin>> {
        self.targets.read().await.get(target).map(|e| e.bins.clone())
    }
}

/// Which transcode the preference implies, if any.
fn transcode_direction(
    preference: Option<&str>,
    format: CodestreamFormat,
) -> Option<TranscodeDirection> {
    match preference {
        Some("htj2k") if !format.is_high_throughput() => Some(TranscodeDirection::ToHighThroughput),
        Some("j2k") if format.is_high_throughput() => Some(TranscodeDirection::ToLegacy),
        _ => None,
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of snapshots to the backend and adoption of its configuration.
//!
//! The [`Synchronizer`] owns the consumer side of the delivery queue. It
//! fetches the configuration once at startup, then drains the queue until it
//! dequeues [`QueueEntry::Shutdown`]. Every `/collect` response carries the
//! configuration to run with next; it is validated and swapped in as a whole.

pub mod connection;
pub mod transport;

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
};
use hyper::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{validate_config, AgentConfig};
use crate::packages::PackagesPayload;
use crate::queue::DeliveryQueue;
use crate::snapshot::Snapshot;

pub use transport::{ApiRequest, ApiResponse, Endpoint, HttpsTransport, Transport};

/// Failure of a single request attempt below HTTP semantics.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no address of {0} accepted a connection")]
    Unreachable(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response body exceeds {0} bytes")]
    ResponseTooLarge(usize),
}

/// Failure of a delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compress(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("backend answered with status {0}")]
    Status(StatusCode),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("response carries no configuration")]
    MissingConfig,
}

/// Items flowing from the agent loop to the synchronizer.
#[derive(Debug)]
pub enum QueueEntry {
    Snapshot(Box<Snapshot>),
    /// Ask the backend for a configuration without sending metrics.
    RequestConfig,
    /// Ends the consumer loop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// Serializes `payload` to JSON and gzips it.
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, SyncError> {
    let json = serde_json::to_vec(payload).map_err(SyncError::Encode)?;
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(json.len() / 4 + 64),
        Compression::default(),
    );
    encoder.write_all(&json)?;
    Ok(Bytes::from(encoder.finish()?))
}

struct ConfigSlot {
    current: Arc<AgentConfig>,
    initialized: bool,
}

pub struct Synchronizer {
    transport: Arc<dyn Transport>,
    token: String,
    queue: Arc<DeliveryQueue<QueueEntry>>,
    config: RwLock<ConfigSlot>,
    stop: CancellationToken,
    state: Mutex<SyncState>,
}

impl Synchronizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        token: impl Into<String>,
        queue: Arc<DeliveryQueue<QueueEntry>>,
    ) -> Self {
        Self {
            transport,
            token: token.into(),
            queue,
            config: RwLock::new(ConfigSlot {
                current: Arc::new(AgentConfig::default()),
                initialized: false,
            }),
            stop: CancellationToken::new(),
            state: Mutex::new(SyncState::Init),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Spawns the consumer loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    async fn run(&self) {
        self.set_state(SyncState::Running);
        debug!("Synchronizer started");
        self.request_config().await;

        while !self.stop.is_cancelled() {
            let entry = self.queue.get().await;
            let finished = match entry {
                QueueEntry::Shutdown => true,
                QueueEntry::RequestConfig => {
                    self.request_config().await;
                    false
                }
                QueueEntry::Snapshot(snapshot) => {
                    self.send(Endpoint::Collect, snapshot.as_ref()).await;
                    false
                }
            };
            self.queue.task_done();
            if finished {
                break;
            }
        }

        self.set_state(SyncState::Stopped);
        debug!("Synchronizer stopped");
    }

    /// Requests termination. Backoff waits end immediately and no new
    /// attempt starts.
    pub fn stop(&self) {
        self.set_state(SyncState::Stopping);
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn current_config(&self) -> Arc<AgentConfig> {
        Arc::clone(
            &self
                .config
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .current,
        )
    }

    fn is_initialized(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .initialized
    }

    /// Installs a validated configuration.
    pub fn replace_config(&self, config: AgentConfig) {
        let mut slot = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if slot.current.enabled != config.enabled {
            info!(enabled = config.enabled, "Backend toggled collection");
        }
        slot.current = Arc::new(config);
        slot.initialized = true;
    }

    /// Current configuration, fetched from the backend first if none was
    /// ever received.
    pub async fn get_config(&self) -> Arc<AgentConfig> {
        if !self.is_initialized() {
            self.request_config().await;
        }
        self.current_config()
    }

    async fn request_config(&self) {
        self.send(Endpoint::Collect, &json!({ "get_config": true })).await;
    }

    /// Posts the package inventory.
    pub async fn send_packages(&self, payload: &PackagesPayload) -> Option<Value> {
        self.send(Endpoint::Packages, payload).await
    }

    fn build_request(
        &self,
        endpoint: Endpoint,
        body: Bytes,
        timeout: Duration,
    ) -> Result<ApiRequest, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|_| {
            SyncError::Transport(TransportError::InvalidRequest(
                "credential contains invalid header characters".to_string(),
            ))
        })?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(ApiRequest {
            endpoint,
            headers,
            body,
            timeout,
        })
    }

    async fn attempt(&self, request: &ApiRequest) -> Result<Value, SyncError> {
        let response = self.transport.post(request).await?;
        if response.status != StatusCode::OK {
            return Err(SyncError::Status(response.status));
        }
        let body: Value = serde_json::from_slice(&response.body).map_err(SyncError::Decode)?;
        if request.endpoint == Endpoint::Collect {
            let raw = body.get("config").ok_or(SyncError::MissingConfig)?;
            self.replace_config(validate_config(raw));
        }
        Ok(body)
    }

    /// Waits for `duration` unless stop is requested first. Returns true when
    /// stopped.
    async fn wait_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.stop.cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }

    /// Delivers `payload` with linear backoff. Returns the decoded response
    /// body, or `None` once every attempt failed or stop was requested.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        endpoint: Endpoint,
        payload: &T,
    ) -> Option<Value> {
        let options = self.current_config().request_options;
        let body = match encode_payload(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(%endpoint, "Dropping payload: {e}");
                return None;
            }
        };
        let request = match self.build_request(endpoint, body, options.timeout()) {
            Ok(request) => request,
            Err(e) => {
                error!(%endpoint, "Dropping payload: {e}");
                return None;
            }
        };

        let attempts = options.retry.max(1);
        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.attempt(&request).await {
                Ok(body) => {
                    debug!(
                        %endpoint,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Synchronization succeeded"
                    );
                    return Some(body);
                }
                Err(e) => {
                    warn!(%endpoint, attempt, attempts, "Synchronization attempt failed: {e}");
                }
            }
            if attempt == attempts || self.is_stopped() {
                break;
            }
            let backoff = options.backoff(attempt);
            info!(%endpoint, "Retrying in {}s", backoff.as_secs());
            if self.wait_or_stop(backoff).await {
                debug!(%endpoint, "Stop requested during backoff");
                break;
            }
        }
        error!(%endpoint, attempts, "Giving up on payload after failed attempts");
        None
    }
}

//! Broker HTTP Client
//!
//! Typed client for the broker's control plane. Every request carries a
//! connect and a total timeout, so no caller can block indefinitely.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::error::{bytes_with_limit, check_response, json_with_limit, BrokerApiError};
use super::types::{ServerInfo, StreamInfo, StreamsResponse, DEFAULT_RTSP_PORT};
use crate::source::encode_query_value;

const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const QUERY_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(2);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames up to this age are served from the broker's cache.
const SNAPSHOT_CACHE_HINT: &str = "30s";

/// Broker HTTP client
///
/// Cheap to share behind an `Arc`; the underlying connection pools are reused
/// across calls. Snapshot requests use their own keep-alive pool so a slow
/// camera never starves control requests.
pub struct BrokerClient {
    base_url: String,
    api_port: u16,
    base_path: String,
    control: Client,
    query: Client,
    snapshot: Client,
    configured_rtsp_port: u16,
    rtsp_port: Mutex<Option<u16>>,
}

fn build_client(connect_timeout: Duration) -> Result<Client, BrokerApiError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(4)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .map_err(|e| BrokerApiError::Network(format!("failed to build HTTP client: {e}")))
}

impl BrokerClient {
    /// Client for `http://127.0.0.1:<api_port><base_path>`.
    pub fn new(api_port: u16, base_path: &str, configured_rtsp_port: u16) -> Result<Self, BrokerApiError> {
        let base_path = normalize_base_path(base_path);
        Self::with_base_url(
            format!("http://127.0.0.1:{api_port}{base_path}"),
            api_port,
            &base_path,
            configured_rtsp_port,
        )
    }

    /// Client for an explicit base URL (used by tests against a mock broker).
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_port: u16,
        base_path: &str,
        configured_rtsp_port: u16,
    ) -> Result<Self, BrokerApiError> {
        let snapshot = Client::builder()
            .connect_timeout(QUERY_CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| BrokerApiError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_port,
            base_path: normalize_base_path(base_path),
            control: build_client(CONTROL_CONNECT_TIMEOUT)?,
            query: build_client(QUERY_CONNECT_TIMEOUT)?,
            snapshot,
            configured_rtsp_port,
            rtsp_port: Mutex::new(None),
        })
    }

    pub fn from_config(config: &nvr_core::config::BrokerConfig) -> Result<Self, BrokerApiError> {
        Self::new(config.api_port, &config.base_path, config.rtsp_port)
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub const fn api_port(&self) -> u16 {
        self.api_port
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base_url)
    }

    /// Register `name` with a single source.
    pub async fn add_stream(&self, name: &str, source: &str) -> Result<(), BrokerApiError> {
        self.add_stream_multi(name, &[source]).await
    }

    /// Register `name` with several sources (`src=a&src=b...`).
    pub async fn add_stream_multi<S: AsRef<str>>(&self, name: &str, sources: &[S]) -> Result<(), BrokerApiError> {
        let mut query = String::from("/api/streams?");
        for source in sources {
            query.push_str("src=");
            query.push_str(&encode_query_value(source.as_ref()));
            query.push('&');
        }
        query.push_str("name=");
        query.push_str(&encode_query_value(name));

        let response = self
            .control
            .put(self.url(&query))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        check_response(response)?;
        info!(stream = name, sources = sources.len(), "Registered stream with broker");
        Ok(())
    }

    /// Unregister `name`. Falls back to the legacy `DELETE /api/streams/<name>` form.
    pub async fn remove_stream(&self, name: &str) -> Result<(), BrokerApiError> {
        let encoded = encode_query_value(name);
        let response = self
            .control
            .delete(self.url(&format!("/api/streams?src={encoded}")))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            info!(stream = name, "Removed stream from broker");
            return Ok(());
        }

        debug!(stream = name, status = %response.status(), "Stream removal failed, trying legacy endpoint");
        let response = self
            .control
            .delete(self.url(&format!("/api/streams/{encoded}")))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        check_response(response)?;
        info!(stream = name, "Removed stream from broker (legacy endpoint)");
        Ok(())
    }

    /// All registered streams.
    pub async fn list_streams(&self) -> Result<StreamsResponse, BrokerApiError> {
        let response = self
            .query
            .get(self.url("/api/streams"))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let response = check_response(response)?;
        json_with_limit(response).await
    }

    /// Whether the broker lists `name` among its registered streams.
    ///
    /// A malformed or non-200 answer counts as "not registered" so callers
    /// re-register rather than trust a URL that may not exist.
    pub async fn stream_exists(&self, name: &str) -> Result<bool, BrokerApiError> {
        match self.list_streams().await {
            Ok(streams) => Ok(streams.contains_key(name)),
            Err(e @ (BrokerApiError::Network(_) | BrokerApiError::Timeout { .. })) => Err(e),
            Err(e) => {
                warn!(stream = name, error = %e, "Unexpected stream list from broker, treating as not registered");
                Ok(false)
            }
        }
    }

    /// Producer/consumer details for one stream; `None` when not registered.
    pub async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, BrokerApiError> {
        let response = self
            .query
            .get(self.url(&format!("/api/streams?src={}", encode_query_value(name))))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_response(response)?;
        let value: serde_json::Value = json_with_limit(response).await?;

        // Older brokers key the answer by stream name; newer ones return the stream itself.
        let stream = match value.get(name) {
            Some(inner) => inner.clone(),
            None if value.get("producers").is_some() || value.get("consumers").is_some() => value,
            None => return Ok(None),
        };
        Ok(Some(serde_json::from_value(stream)?))
    }

    /// Ask the broker to keep a stream connected without consumers.
    pub async fn preload(&self, name: &str, audio: bool) -> Result<(), BrokerApiError> {
        let mut query = format!("/api/preload?src={}&video", encode_query_value(name));
        if audio {
            query.push_str("&audio");
        }
        let response = self
            .control
            .put(self.url(&query))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        check_response(response)?;
        debug!(stream = name, "Preloaded stream");
        Ok(())
    }

    /// WebRTC signalling endpoint for a stream.
    #[must_use]
    pub fn get_webrtc_url(&self, name: &str) -> String {
        self.url(&format!("/api/webrtc?src={}", encode_query_value(name)))
    }

    /// Broker-native HLS playlist for a stream.
    #[must_use]
    pub fn get_hls_url(&self, name: &str) -> String {
        format!(
            "http://localhost:{}{}/api/stream.m3u8?src={}",
            self.api_port,
            self.base_path,
            encode_query_value(name)
        )
    }

    /// Server information, from `/api/server` or, on older brokers, `/api`.
    pub async fn get_server_info(&self) -> Result<ServerInfo, BrokerApiError> {
        let response = self
            .query
            .get(self.url("/api/server"))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let response = if response.status() == StatusCode::NOT_FOUND {
            self.query
                .get(self.url("/api"))
                .timeout(QUERY_TIMEOUT)
                .send()
                .await?
        } else {
            response
        };
        let response = check_response(response)?;
        json_with_limit(response).await
    }

    /// Broker RTSP port: cached server info, else the configured port.
    pub async fn rtsp_port(&self) -> u16 {
        if let Some(port) = *self.rtsp_port.lock() {
            return port;
        }
        match self.get_server_info().await {
            Ok(info) => {
                let port = info.rtsp_port().unwrap_or_else(|| {
                    warn!("RTSP listen address missing from server info, using {}", self.fallback_rtsp_port());
                    self.fallback_rtsp_port()
                });
                *self.rtsp_port.lock() = Some(port);
                port
            }
            Err(e) => {
                debug!(error = %e, "Server info unavailable, using configured RTSP port");
                self.fallback_rtsp_port()
            }
        }
    }

    fn fallback_rtsp_port(&self) -> u16 {
        if self.configured_rtsp_port == 0 {
            DEFAULT_RTSP_PORT
        } else {
            self.configured_rtsp_port
        }
    }

    /// RTSP restream URL, only once the broker confirms the registration.
    pub async fn get_rtsp_url(&self, name: &str) -> Result<String, BrokerApiError> {
        if !self.stream_exists(name).await? {
            return Err(BrokerApiError::NotRegistered(name.to_string()));
        }
        let port = self.rtsp_port().await;
        Ok(format!("rtsp://localhost:{port}/{name}"))
    }

    /// Latest decoded JPEG frame. The cache hint lets the broker answer from a
    /// recent frame instead of waking a sleeping source.
    pub async fn snapshot(&self, name: &str) -> Result<Bytes, BrokerApiError> {
        let response = self
            .snapshot
            .get(self.url(&format!(
                "/api/frame.jpeg?src={}&cache={SNAPSHOT_CACHE_HINT}",
                encode_query_value(name)
            )))
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await?;
        let response = check_response(response)?;
        bytes_with_limit(response).await
    }

    /// Cheap liveness probe: `GET /api/config` answers 200.
    pub async fn update_config(&self) -> Result<(), BrokerApiError> {
        let response = self
            .query
            .get(self.url("/api/config"))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    /// Readiness probe: `GET /api/streams` within 2 s answering 200 or 401.
    pub async fn is_api_ready(&self) -> bool {
        let result = self
            .query
            .get(self.url("/api/streams"))
            .timeout(READY_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                let ready = status == StatusCode::OK || status == StatusCode::UNAUTHORIZED;
                if !ready {
                    debug!(%status, "Broker API answered but is not ready");
                }
                ready
            }
            Err(e) => {
                debug!(error = %e, "Broker API probe failed");
                false
            }
        }
    }

    /// Forget cached server details (after a broker restart).
    pub fn invalidate_cache(&self) {
        *self.rtsp_port.lock() = None;
    }
}

fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::stream::{validate_stream_name, StreamDescriptor};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub webrtc: WebRtcConfig,
    pub recording: RecordingConfig,
    pub auth: AuthConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
    /// Desired stream set, reconciled into the broker at startup.
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub binary_path: Option<String>,
    pub config_dir: String,
    pub api_port: u16,
    pub rtsp_port: u16,
    /// URL prefix for the broker API, e.g. "/go2rtc". Empty for none.
    pub base_path: String,
    /// Process name used for argv[0] and `/proc` scans.
    pub name: String,
    pub log_level: String,
    /// Leftovers removed on stop (s6-style config copies and log dirs).
    pub scratch_paths: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            config_dir: "/var/lib/nvr/broker".to_string(),
            api_port: 1984,
            rtsp_port: 8554,
            base_path: String::new(),
            name: "go2rtc".to_string(),
            log_level: "info".to_string(),
            scratch_paths: vec![
                "/dev/shm/logs/go2rtc".to_string(),
                "/dev/shm/go2rtc.yaml".to_string(),
            ],
        }
    }
}

impl BrokerConfig {
    /// Base path normalized to either "" or "/prefix" without a trailing slash.
    #[must_use]
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_path.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    #[must_use]
    pub fn api_base_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}{}",
            self.api_port,
            self.normalized_base_path()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub enabled: bool,
    pub listen_port: u16,
    pub stun_enabled: bool,
    pub stun_server: String,
    /// Comma-separated ICE server URLs.
    pub ice_servers: String,
    pub external_ip: String,
    pub turn_enabled: bool,
    pub turn_server_url: String,
    pub turn_username: String,
    pub turn_password: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 8555,
            stun_enabled: true,
            stun_server: "stun.l.google.com:19302".to_string(),
            ice_servers: String::new(),
            external_ip: String::new(),
            turn_enabled: false,
            turn_server_url: String::new(),
            turn_username: String::new(),
            turn_password: String::new(),
        }
    }
}

/// Who produces the live HLS output for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HlsPolicy {
    /// Broker-native HLS when the broker is up, else the in-process writer.
    #[default]
    Auto,
    /// Always the in-process writer.
    Native,
    /// Broker-native HLS only.
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub storage_path: String,
    pub storage_path_hls: Option<String>,
    pub mp4_storage_path: Option<String>,
    pub record_mp4_directly: bool,
    pub hls_policy: HlsPolicy,
    /// Legacy switch; `true` forces `HlsPolicy::Native`.
    pub force_native_hls: bool,
    /// Target HLS segment length in seconds (clamped to 0.5..=10).
    pub hls_segment_duration: f64,
    pub hls_list_size: usize,
    /// MP4 file length in seconds.
    pub mp4_segment_duration: u64,
    /// Streams whose MP4 hard ceiling is 1x the segment duration instead of 2x.
    pub high_bitrate_streams: Vec<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            storage_path: "/var/lib/nvr/recordings".to_string(),
            storage_path_hls: None,
            mp4_storage_path: None,
            record_mp4_directly: false,
            hls_policy: HlsPolicy::Auto,
            force_native_hls: false,
            hls_segment_duration: 2.0,
            hls_list_size: 5,
            mp4_segment_duration: 900,
            high_bitrate_streams: Vec::new(),
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub fn effective_hls_policy(&self) -> HlsPolicy {
        if self.force_native_hls {
            HlsPolicy::Native
        } else {
            self.hls_policy
        }
    }

    /// `<storage_path_hls>` if set, else `<storage_path>/hls`.
    #[must_use]
    pub fn hls_root(&self) -> PathBuf {
        self.storage_path_hls
            .as_deref()
            .filter(|p| !p.is_empty())
            .map_or_else(|| Path::new(&self.storage_path).join("hls"), PathBuf::from)
    }

    /// `<mp4_storage_path>` if set, else `<storage_path>/mp4`.
    #[must_use]
    pub fn mp4_root(&self) -> PathBuf {
        self.mp4_storage_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map_or_else(|| Path::new(&self.storage_path).join("mp4"), PathBuf::from)
    }

    #[must_use]
    pub fn max_duration_factor(&self, stream_name: &str) -> u32 {
        if self.high_bitrate_streams.iter().any(|s| s == stream_name) {
            1
        } else {
            2
        }
    }
}

/// Web UI credentials. Handled by the HTTP surface, never written into the broker config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub web_username: String,
    pub web_password: String,
    pub web_auth_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub stream_max_consecutive_failures: u32,
    pub stream_reregistration_cooldown_secs: u64,
    pub process_max_api_failures: u32,
    pub min_streams_for_consensus: usize,
    pub process_restart_cooldown_secs: u64,
    pub max_restarts_per_window: usize,
    pub restart_window_secs: u64,
    pub stuck_stream_max_stalled_checks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stream_max_consecutive_failures: 3,
            stream_reregistration_cooldown_secs: 60,
            process_max_api_failures: 3,
            min_streams_for_consensus: 2,
            process_restart_cooldown_secs: 120,
            max_restarts_per_window: 5,
            restart_window_secs: 600,
            stuck_stream_max_stalled_checks: 3,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NVR__BROKER__API_PORT=1984 etc.
        builder = builder.add_source(
            Environment::with_prefix("NVR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Directory the broker log file is colocated in.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .file_path
            .as_deref()
            .and_then(|p| Path::new(p).parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(
                || Path::new(&self.recording.storage_path).join("logs"),
                Path::to_path_buf,
            )
    }

    /// Check for misconfigurations, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.api_port == 0 {
            errors.push("broker.api_port must be non-zero".to_string());
        }
        if self.broker.rtsp_port == 0 {
            errors.push("broker.rtsp_port must be non-zero".to_string());
        }
        if self.broker.api_port == self.broker.rtsp_port {
            errors.push("broker.api_port and broker.rtsp_port must differ".to_string());
        }
        if self.webrtc.enabled
            && (self.webrtc.listen_port == self.broker.api_port
                || self.webrtc.listen_port == self.broker.rtsp_port)
        {
            errors.push("webrtc.listen_port collides with a broker port".to_string());
        }
        if self.broker.name.is_empty() {
            errors.push("broker.name must not be empty".to_string());
        }
        if self.broker.config_dir.is_empty() {
            errors.push("broker.config_dir must not be empty".to_string());
        }
        if self.webrtc.turn_enabled
            && (self.webrtc.turn_server_url.is_empty()
                || self.webrtc.turn_username.is_empty()
                || self.webrtc.turn_password.is_empty())
        {
            errors.push("webrtc.turn_* must all be set when TURN is enabled".to_string());
        }

        if self.recording.storage_path.is_empty() {
            errors.push("recording.storage_path must not be empty".to_string());
        }
        if !self.recording.hls_segment_duration.is_finite() || self.recording.hls_segment_duration <= 0.0 {
            errors.push("recording.hls_segment_duration must be positive".to_string());
        }
        if self.recording.mp4_segment_duration == 0 {
            errors.push("recording.mp4_segment_duration must be positive".to_string());
        }
        if self.health.interval_secs == 0 {
            errors.push("health.interval_secs must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if let Err(e) = validate_stream_name(&stream.name) {
                errors.push(format!("streams: {e}"));
            }
            if !seen.insert(stream.name.as_str()) {
                errors.push(format!("streams: duplicate name '{}'", stream.name));
            }
            match url::Url::parse(&stream.url) {
                Ok(parsed) if matches!(parsed.scheme(), "rtsp" | "rtsps" | "rtmp" | "http" | "https") => {}
                Ok(parsed) => errors.push(format!(
                    "streams: '{}' uses unsupported scheme '{}'",
                    stream.name,
                    parsed.scheme()
                )),
                Err(e) => errors.push(format!("streams: '{}' has an invalid url: {e}", stream.name)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

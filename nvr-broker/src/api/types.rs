//! Broker API response types
//!
//! The broker reports streams as a JSON object keyed by stream name. Fields
//! are optional throughout: a missing field is treated as "no data", never as
//! a parse failure.

use serde::Deserialize;
use std::collections::HashMap;

/// Default RTSP port when the broker does not report one.
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// `GET /api/streams` response
pub type StreamsResponse = HashMap<String, StreamInfo>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub producers: Option<Vec<Producer>>,
    #[serde(default)]
    pub consumers: Option<Vec<Consumer>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Producer {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bytes_recv: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Consumer {
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub bytes_send: Option<u64>,
}

impl StreamInfo {
    /// Sum of `bytes_recv` over all producers.
    #[must_use]
    pub fn bytes_recv(&self) -> u64 {
        self.producers
            .iter()
            .flatten()
            .filter_map(|p| p.bytes_recv)
            .sum()
    }

    /// Sum of `bytes_send` over all consumers.
    #[must_use]
    pub fn bytes_send(&self) -> u64 {
        self.consumers
            .iter()
            .flatten()
            .filter_map(|c| c.bytes_send)
            .sum()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.as_ref().map_or(0, Vec::len)
    }
}

/// Byte counters for one stream, as used by stall detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub bytes_recv: u64,
    pub bytes_send: u64,
}

impl From<&StreamInfo> for ByteCounters {
    fn from(info: &StreamInfo) -> Self {
        Self {
            bytes_recv: info.bytes_recv(),
            bytes_send: info.bytes_send(),
        }
    }
}

/// `GET /api/server` (or `GET /api` on older brokers)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rtsp: Option<RtspInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtspInfo {
    /// Listen address such as `":8554"` or `"0.0.0.0:8554"`.
    #[serde(default)]
    pub listen: Option<String>,
}

impl ServerInfo {
    /// RTSP port parsed from `rtsp.listen`, if present and well formed.
    #[must_use]
    pub fn rtsp_port(&self) -> Option<u16> {
        let listen = self.rtsp.as_ref()?.listen.as_deref()?;
        let (_, port) = listen.rsplit_once(':')?;
        port.parse().ok().filter(|p| *p != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_byte_totals() {
        let json = r#"{
            "front": {
                "producers": [
                    {"url": "rtsp://cam/1", "bytes_recv": 1000},
                    {"url": "rtsp://cam/2", "bytes_recv": 24}
                ],
                "consumers": [{"remote_addr": "127.0.0.1:5000", "bytes_send": 512}, {}]
            },
            "idle": {"producers": null, "consumers": null},
            "bare": {}
        }"#;
        let streams: StreamsResponse = serde_json::from_str(json).unwrap();

        let front = &streams["front"];
        assert_eq!(front.bytes_recv(), 1024);
        assert_eq!(front.bytes_send(), 512);
        assert_eq!(front.producer_count(), 2);
        assert_eq!(front.consumer_count(), 2);

        assert_eq!(ByteCounters::from(&streams["idle"]), ByteCounters::default());
        assert_eq!(streams["bare"].producer_count(), 0);
    }

    #[test]
    fn test_rtsp_port_parsing() {
        let info: ServerInfo = serde_json::from_str(r#"{"rtsp": {"listen": ":8555"}}"#).unwrap();
        assert_eq!(info.rtsp_port(), Some(8555));

        let info: ServerInfo = serde_json::from_str(r#"{"rtsp": {"listen": "0.0.0.0:9554"}}"#).unwrap();
        assert_eq!(info.rtsp_port(), Some(9554));

        let info: ServerInfo = serde_json::from_str(r#"{"rtsp": {"listen": "bogus"}}"#).unwrap();
        assert_eq!(info.rtsp_port(), None);

        let info: ServerInfo = serde_json::from_str(r#"{"version": "1.9"}"#).unwrap();
        assert_eq!(info.rtsp_port(), None);
    }
}

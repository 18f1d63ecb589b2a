use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Longest stream name accepted; names become directory and broker identifiers.
pub const MAX_STREAM_NAME_LEN: usize = 64;

/// RTSP transport the broker should use towards the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A camera as the user configured it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: TransportProtocol,
    #[serde(default)]
    pub backchannel_enabled: bool,
    #[serde(default)]
    pub record_audio: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl StreamDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
            protocol: TransportProtocol::Tcp,
            backchannel_enabled: false,
            record_audio: false,
            enabled: true,
        }
    }

    /// Username/password pair, only when both are present and non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

/// Partial update for a reload. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPatch {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<TransportProtocol>,
    pub backchannel_enabled: Option<bool>,
    pub record_audio: Option<bool>,
}

impl StreamPatch {
    /// Resolve the patch against the current descriptor.
    ///
    /// Without a current descriptor the defaults are TCP, no backchannel and
    /// no audio, and the patch must carry a URL.
    pub fn resolve(&self, name: &str, current: Option<&StreamDescriptor>) -> Result<StreamDescriptor> {
        let url = self
            .url
            .clone()
            .or_else(|| current.map(|c| c.url.clone()))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("no URL available for stream {name}")))?;

        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        Ok(StreamDescriptor {
            name: name.to_string(),
            url,
            username: non_empty(&self.username).or_else(|| current.and_then(|c| non_empty(&c.username))),
            password: non_empty(&self.password).or_else(|| current.and_then(|c| non_empty(&c.password))),
            protocol: self
                .protocol
                .or_else(|| current.map(|c| c.protocol))
                .unwrap_or_default(),
            backchannel_enabled: self
                .backchannel_enabled
                .or_else(|| current.map(|c| c.backchannel_enabled))
                .unwrap_or(false),
            record_audio: self
                .record_audio
                .or_else(|| current.map(|c| c.record_audio))
                .unwrap_or(false),
            enabled: current.map_or(true, |c| c.enabled),
        })
    }
}

/// Names must be non-empty, bounded, and usable as a single path component.
pub fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("stream name is empty".to_string()));
    }
    if name.len() > MAX_STREAM_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "stream name '{name}' exceeds {MAX_STREAM_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidInput(format!(
            "stream name '{name}' is not a valid path component"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing() -> StreamDescriptor {
        StreamDescriptor {
            name: "porch".to_string(),
            url: "rtsp://10.0.0.5/main".to_string(),
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            protocol: TransportProtocol::Udp,
            backchannel_enabled: true,
            record_audio: true,
            enabled: true,
        }
    }

    #[test]
    fn test_patch_keeps_current_values() {
        let resolved = StreamPatch::default().resolve("porch", Some(&existing())).unwrap();
        assert_eq!(resolved, existing());
    }

    #[test]
    fn test_patch_explicit_values_override() {
        let patch = StreamPatch {
            url: Some("rtsp://10.0.0.6/sub".to_string()),
            protocol: Some(TransportProtocol::Tcp),
            record_audio: Some(false),
            ..Default::default()
        };
        let resolved = patch.resolve("porch", Some(&existing())).unwrap();
        assert_eq!(resolved.url, "rtsp://10.0.0.6/sub");
        assert_eq!(resolved.protocol, TransportProtocol::Tcp);
        assert!(!resolved.record_audio);
        assert!(resolved.backchannel_enabled);
        assert_eq!(resolved.username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_patch_without_current_uses_defaults() {
        let patch = StreamPatch {
            url: Some("rtsp://cam/1".to_string()),
            ..Default::default()
        };
        let resolved = patch.resolve("new", None).unwrap();
        assert_eq!(resolved.protocol, TransportProtocol::Tcp);
        assert!(!resolved.backchannel_enabled);
        assert!(!resolved.record_audio);
        assert!(resolved.enabled);

        assert!(StreamPatch::default().resolve("new", None).is_err());
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let mut desc = StreamDescriptor::new("a", "rtsp://x");
        assert!(desc.credentials().is_none());
        desc.username = Some("u".to_string());
        assert!(desc.credentials().is_none());
        desc.password = Some("p".to_string());
        assert_eq!(desc.credentials(), Some(("u", "p")));
    }

    #[test]
    fn test_validate_stream_name() {
        assert!(validate_stream_name("front_door").is_ok());
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name("..").is_err());
        assert!(validate_stream_name("a/b").is_err());
        assert!(validate_stream_name(&"x".repeat(MAX_STREAM_NAME_LEN + 1)).is_err());
    }
}

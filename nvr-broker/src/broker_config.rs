//! Broker configuration file generation.
//!
//! The file may carry TURN credentials, so it is always written `0600`.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nvr_core::config::{BrokerConfig, WebRtcConfig};
use serde::Serialize;

const FALLBACK_STUN_SERVERS: [&str; 4] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BrokerYaml {
    pub api: ApiSection,
    pub rtsp: RtspSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc: Option<WebRtcSection>,
    pub log: LogSection,
    pub ffmpeg: BTreeMap<String, String>,
    /// Always empty; streams are registered at runtime over the API.
    pub streams: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApiSection {
    pub listen: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    pub origin: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RtspSection {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebRtcSection {
    pub listen: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogSection {
    pub level: String,
}

impl BrokerYaml {
    #[must_use]
    pub fn from_config(broker: &BrokerConfig, webrtc: &WebRtcConfig) -> Self {
        let ffmpeg = BTreeMap::from([
            (
                "h264".to_string(),
                "-codec:v libx264 -g:v 30 -preset:v superfast".to_string(),
            ),
            (
                "h265".to_string(),
                "-codec:v libx265 -g:v 30 -preset:v superfast".to_string(),
            ),
        ]);

        Self {
            api: ApiSection {
                listen: format!(":{}", broker.api_port),
                base_path: broker.normalized_base_path(),
                origin: "*".to_string(),
            },
            rtsp: RtspSection {
                listen: format!(":{}", broker.rtsp_port),
            },
            webrtc: webrtc.enabled.then(|| webrtc_section(webrtc)),
            log: LogSection {
                level: broker.log_level.clone(),
            },
            ffmpeg,
            streams: BTreeMap::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!("# Generated by nvr; changes are overwritten on start\n{body}"))
    }

    /// Write the file with mode `0600`, tightening an existing file's mode too.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let yaml = self.to_yaml().map_err(std::io::Error::other)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(yaml.as_bytes())?;
        file.sync_all()
    }
}

fn webrtc_section(webrtc: &WebRtcConfig) -> WebRtcSection {
    let mut ice_servers: Vec<IceServer> = webrtc
        .ice_servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| IceServer {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect();

    if ice_servers.is_empty() && webrtc.stun_enabled {
        let mut urls = vec![format!("stun:{}", webrtc.stun_server)];
        urls.extend(FALLBACK_STUN_SERVERS.iter().map(|s| (*s).to_string()));
        ice_servers.push(IceServer {
            urls,
            username: None,
            credential: None,
        });
    }

    if webrtc.turn_enabled && !webrtc.turn_server_url.is_empty() {
        ice_servers.push(IceServer {
            urls: vec![webrtc.turn_server_url.clone()],
            username: Some(webrtc.turn_username.clone()),
            credential: Some(webrtc.turn_password.clone()),
        });
    }

    let host = if webrtc.external_ip.trim().is_empty() {
        "*"
    } else {
        webrtc.external_ip.trim()
    };
    let mut candidates = vec![format!("{host}:{}", webrtc.listen_port)];
    if webrtc.stun_enabled {
        candidates.push(format!("stun:{}", webrtc.stun_server));
    }

    WebRtcSection {
        listen: format!(":{}", webrtc.listen_port),
        ice_servers,
        candidates,
    }
}

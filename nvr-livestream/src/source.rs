//! Where a media session's packets come from.

use async_trait::async_trait;
use nvr_mux::{MediaPacket, TrackSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Packet(MediaPacket),
    /// The reader is falling behind; non-key video may be dropped until the
    /// next key frame.
    Pressure,
    /// Codec parameters changed mid-stream.
    TracksChanged(TrackSet),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid source url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("source offers no usable track")]
    NoTracks,

    #[error("rtsp error: {0}")]
    Rtsp(#[from] retina::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("source closed: {0}")]
    Closed(String),
}

impl From<SourceError> for nvr_core::Error {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::InvalidUrl { .. } => Self::InvalidInput(err.to_string()),
            SourceError::NoTracks => Self::ProtocolDrift(err.to_string()),
            SourceError::Rtsp(_) | SourceError::Timeout(_) | SourceError::Closed(_) => {
                Self::Transient(err.to_string())
            }
        }
    }
}

/// An open input delivering packets in demux order.
#[async_trait]
pub trait PacketSource: Send {
    fn tracks(&self) -> &TrackSet;

    /// Frame duration in the video time base, when the source knows its frame rate.
    fn video_frame_duration(&self) -> Option<i64> {
        None
    }

    /// `Ok(None)` at end of stream.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError>;
}

#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, url: &str, record_audio: bool) -> Result<Box<dyn PacketSource>, SourceError>;
}

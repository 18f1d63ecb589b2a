//! Codec-neutral media packets and track descriptions handed to the writers.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrack {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    /// Ticks per second of packet timestamps (90 kHz for RTP video).
    pub clock_rate: u32,
    /// `AVCDecoderConfigurationRecord` for H.264.
    pub extra_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub codec: AudioCodec,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    /// `AudioSpecificConfig` for AAC.
    pub extra_data: Bytes,
    /// Complete ISO-BMFF sample entry box (`mp4a` ...), when the source provides one.
    pub sample_entry: Option<Bytes>,
}

/// The tracks a session is recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

impl TrackSet {
    #[must_use]
    pub fn clock_rate(&self, kind: MediaKind) -> Option<u32> {
        match kind {
            MediaKind::Video => self.video.as_ref().map(|v| v.clock_rate),
            MediaKind::Audio => self.audio.as_ref().map(|a| a.clock_rate),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// One encoded access unit (video frame or audio frame).
///
/// `pts`/`dts` are in `1 / time_base` second units. Either may be missing on
/// input; the normalizer fills them before a packet reaches a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub time_base: u32,
    pub is_key: bool,
    pub data: Bytes,
}

impl MediaPacket {
    #[must_use]
    pub fn video(pts: i64, time_base: u32, is_key: bool, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MediaKind::Video,
            pts: Some(pts),
            dts: Some(pts),
            time_base,
            is_key,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn audio(pts: i64, time_base: u32, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MediaKind::Audio,
            pts: Some(pts),
            dts: Some(pts),
            time_base,
            is_key: true,
            data: data.into(),
        }
    }

    /// Decode timestamp, falling back to the presentation timestamp.
    #[must_use]
    pub fn decode_ts(&self) -> Option<i64> {
        self.dts.or(self.pts)
    }
}

/// Convert `ts` from a `from`-Hz clock to a `to`-Hz clock, rounding to nearest.
#[must_use]
pub fn rescale(ts: i64, from: u32, to: u32) -> i64 {
    if from == to || from == 0 {
        return ts;
    }
    let num = i128::from(ts) * i128::from(to);
    let den = i128::from(from);
    let half = den / 2;
    let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
    rounded.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(48_000, 48_000, 90_000), 90_000);
        assert_eq!(rescale(1, 1000, 90_000), 90);
        assert_eq!(rescale(1024, 44_100, 90_000), 2090);
        assert_eq!(rescale(-1024, 44_100, 90_000), -2090);
        assert_eq!(rescale(77, 0, 90_000), 77);
    }

    #[test]
    fn test_decode_ts_fallback() {
        let mut packet = MediaPacket::video(100, 90_000, true, vec![1, 2]);
        packet.dts = None;
        assert_eq!(packet.decode_ts(), Some(100));
        packet.pts = None;
        assert_eq!(packet.decode_ts(), None);
    }

    #[test]
    fn test_track_clock_rates() {
        let tracks = TrackSet {
            video: None,
            audio: Some(AudioTrack {
                codec: AudioCodec::Aac,
                clock_rate: 16_000,
                channels: Some(1),
                extra_data: Bytes::from_static(&[0x14, 0x08]),
                sample_entry: None,
            }),
        };
        assert_eq!(tracks.clock_rate(MediaKind::Audio), Some(16_000));
        assert_eq!(tracks.clock_rate(MediaKind::Video), None);
        assert!(!tracks.is_empty());
    }
}

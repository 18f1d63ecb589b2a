//! Timestamp repair applied in-line to every packet before it reaches a writer.
//!
//! Each media kind has its own [`DtsTracker`]. Timestamps stay in the packet's
//! own time base; the writers rescale to their output clocks.

use nvr_mux::{packet::rescale, AudioCodec, MediaKind, MediaPacket, TrackSet};
use tracing::{debug, warn};

/// Forward DTS jumps larger than this are logged as discontinuities.
pub const LARGE_JUMP_TICKS: i64 = 90_000;
/// Largest timestamp the muxers can carry in 32-bit fields.
pub const MAX_MUXER_TS: i64 = i32::MAX as i64;
/// Where a tracker restarts after a rebase.
pub const REBASE_TS: i64 = 1;
/// Largest accepted PTS - DTS gap, in seconds.
pub const MAX_PTS_DTS_GAP_SECS: i64 = 5;
/// Samples per AAC frame.
const AAC_FRAME_SAMPLES: i64 = 1024;

/// What the tracker had to do to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalized {
    /// Timestamps were already sane.
    Clean,
    /// Missing, non-positive, backwards or skewed timestamps were fixed.
    Repaired,
    /// The timeline was moved back to [`REBASE_TS`]; `shift` ticks were subtracted.
    /// Writers must treat this as a discontinuity.
    Rebased { shift: i64 },
}

impl Normalized {
    #[must_use]
    pub const fn is_rebased(self) -> bool {
        matches!(self, Self::Rebased { .. })
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Rebased { .. }, _) => self,
            (_, Self::Rebased { .. }) => other,
            (Self::Repaired, _) | (_, Self::Repaired) => Self::Repaired,
            _ => Self::Clean,
        }
    }
}

/// Decode-timestamp state for one media kind of one session.
#[derive(Debug, Clone, Default)]
pub struct DtsTracker {
    first_dts: i64,
    last_dts: i64,
    time_base: u32,
    initialized: bool,
    /// Subtracted from incoming timestamps after a rebase or splice.
    offset: i64,
    splice_pending: bool,
}

impl DtsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn first_dts(&self) -> i64 {
        self.first_dts
    }

    #[must_use]
    pub const fn last_dts(&self) -> i64 {
        self.last_dts
    }

    #[must_use]
    pub const fn time_base(&self) -> u32 {
        self.time_base
    }

    /// Forget everything; the next packet seeds a fresh timeline.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Continue the current timeline across an upstream reconnect: the next
    /// timestamped packet is mapped to `last_dts + frame_duration`.
    pub fn splice(&mut self) {
        if self.initialized {
            self.splice_pending = true;
        }
    }

    /// Move the timeline back by `shift` ticks without touching the seed state.
    pub fn shift(&mut self, shift: i64) {
        if self.initialized {
            self.offset += shift;
            self.first_dts -= shift;
            self.last_dts -= shift;
        }
    }

    /// Repair `packet` in place. `frame_duration` is in the packet's time base.
    pub fn normalize(&mut self, packet: &mut MediaPacket, frame_duration: i64) -> Normalized {
        let frame_duration = frame_duration.max(1);
        let mut outcome = Normalized::Clean;

        if self.splice_pending {
            if let Some(raw) = packet.decode_ts() {
                self.offset = raw - (self.last_dts + frame_duration);
                self.splice_pending = false;
            }
        }

        let pts = packet.pts.map(|v| v - self.offset);
        let dts = packet.dts.map(|v| v - self.offset);

        if !self.initialized {
            let seed = dts.or(pts).unwrap_or(0);
            self.first_dts = seed;
            self.last_dts = seed;
            self.time_base = packet.time_base;
            self.initialized = true;
        }

        let (mut pts, mut dts) = match (pts, dts) {
            (Some(p), Some(d)) => (p, d),
            (Some(p), None) => (p, p),
            (None, Some(d)) => (d, d),
            (None, None) => {
                outcome = Normalized::Repaired;
                let d = self.last_dts + frame_duration;
                (d, d)
            }
        };

        if pts <= 0 || dts <= 0 {
            outcome = Normalized::Repaired;
            if pts <= 0 {
                pts = if dts > 0 { dts } else { 1 };
            }
            if dts <= 0 {
                dts = if pts > 0 { pts } else { 1 };
            }
        }

        if dts < self.last_dts {
            let gap = (pts - dts).max(0);
            debug!(
                dts,
                last_dts = self.last_dts,
                "Non-monotonic DTS, continuing from last"
            );
            dts = self.last_dts + 1;
            pts = dts + gap;
            outcome = Normalized::Repaired;
        } else if dts - self.last_dts > LARGE_JUMP_TICKS {
            debug!(
                jump = dts - self.last_dts,
                "Large DTS discontinuity accepted"
            );
        }

        if dts > MAX_MUXER_TS || pts > MAX_MUXER_TS {
            let shift = dts - REBASE_TS;
            warn!(dts, shift, "Timestamp would overflow muxer limits, rebasing");
            self.offset += shift;
            dts -= shift;
            pts -= shift;
            self.first_dts = dts;
            outcome = Normalized::Rebased { shift };
        }

        if pts < dts {
            pts = dts;
            outcome = outcome.merge(Normalized::Repaired);
        }
        let max_gap = MAX_PTS_DTS_GAP_SECS * i64::from(packet.time_base.max(1));
        if pts - dts > max_gap {
            pts = dts + max_gap;
            outcome = outcome.merge(Normalized::Repaired);
        }

        self.last_dts = dts;
        packet.pts = Some(pts);
        packet.dts = Some(dts);
        outcome
    }
}

/// Per-session normalizer holding one tracker per media kind.
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    video: DtsTracker,
    audio: DtsTracker,
    video_frame_duration: i64,
    audio_frame_duration: i64,
}

impl TimestampNormalizer {
    /// `video_frame_duration` comes from the source's frame rate when known.
    #[must_use]
    pub fn new(tracks: &TrackSet, video_frame_duration: Option<i64>) -> Self {
        let audio_frame_duration = match tracks.audio.as_ref().map(|a| &a.codec) {
            Some(AudioCodec::Aac) => AAC_FRAME_SAMPLES,
            _ => 1,
        };
        Self {
            video: DtsTracker::new(),
            audio: DtsTracker::new(),
            video_frame_duration: video_frame_duration.unwrap_or(1).max(1),
            audio_frame_duration,
        }
    }

    #[must_use]
    pub const fn tracker(&self, kind: MediaKind) -> &DtsTracker {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Repair `packet` in place. A rebase on one kind shifts the other by the
    /// same wallclock amount so audio and video stay aligned.
    pub fn normalize(&mut self, packet: &mut MediaPacket) -> Normalized {
        let (this, other, duration) = match packet.kind {
            MediaKind::Video => (&mut self.video, &mut self.audio, self.video_frame_duration),
            MediaKind::Audio => (&mut self.audio, &mut self.video, self.audio_frame_duration),
        };
        let outcome = this.normalize(packet, duration);
        if let Normalized::Rebased { shift } = outcome {
            other.shift(rescale(shift, this.time_base(), other.time_base()));
        }
        outcome
    }

    pub fn reset(&mut self) {
        self.video.reset();
        self.audio.reset();
    }

    pub fn splice(&mut self) {
        self.video.splice();
        self.audio.splice();
    }
}

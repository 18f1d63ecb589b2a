//! MP4 segmenting: a pure rotation policy and the rotator that applies it to
//! one session's packets.

use {
    crate::{
        error::SessionError,
        index::{RecordingId, RecordingIndex},
        writers::{WriterHandle, WriterRegistry},
    },
    chrono::{DateTime, Utc},
    nvr_mux::{
        mp4::{Mp4Error, Mp4File},
        MediaKind, MediaPacket, TrackSet,
    },
    std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

/// How long after a file becomes due a key frame may take before the cut is forced.
pub const KEYFRAME_GRACE: Duration = Duration::from_secs(5);
/// How often the index row of the file being written is refreshed.
pub const INDEX_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
/// Delay before retrying a failed open or rotation.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// Segment duration reached and a key frame arrived.
    KeyFrame,
    /// Segment duration reached but no key frame within the grace period.
    Forced,
    /// `segment_duration × max_duration_factor` reached.
    HardCeiling,
    /// A cut was asked for (reconnect, parameter change) and a key frame arrived.
    Requested,
    /// The writer rejected a timestamp; the file is cut at once.
    Discontinuity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub segment_duration: Duration,
    pub max_duration_factor: u32,
    pub keyframe_grace: Duration,
}

impl RotationPolicy {
    #[must_use]
    pub const fn new(segment_duration: Duration, max_duration_factor: u32) -> Self {
        Self {
            segment_duration,
            max_duration_factor,
            keyframe_grace: KEYFRAME_GRACE,
        }
    }

    #[must_use]
    pub fn hard_ceiling(&self) -> Duration {
        self.segment_duration * self.max_duration_factor.max(1)
    }

    /// Decide whether the file opened at `opened_at` must be cut before a packet
    /// arriving at `now`. `key_frame` is true for packets a file may start with.
    #[must_use]
    pub fn decide(
        &self,
        opened_at: Instant,
        cut_requested_at: Option<Instant>,
        now: Instant,
        key_frame: bool,
    ) -> Option<RotationReason> {
        if now.saturating_duration_since(opened_at) >= self.hard_ceiling() {
            return Some(RotationReason::HardCeiling);
        }

        let scheduled = opened_at + self.segment_duration;
        let (due, reason) = match cut_requested_at {
            Some(requested) if requested < scheduled => (requested, RotationReason::Requested),
            _ => (scheduled, RotationReason::KeyFrame),
        };
        if now < due {
            return None;
        }
        if key_frame {
            return Some(reason);
        }
        (now.saturating_duration_since(due) >= self.keyframe_grace).then_some(RotationReason::Forced)
    }
}

/// `recording_YYYYMMDD_HHMMSS.mp4`.
#[must_use]
pub fn recording_file_name(at: DateTime<Utc>) -> String {
    format!("recording_{}.mp4", at.format("%Y%m%d_%H%M%S"))
}

struct ActiveFile {
    file: Mp4File,
    recording_id: RecordingId,
    opened_at: Instant,
    last_index_update: Instant,
}

/// Owns the MP4 file of one session and cuts it according to a [`RotationPolicy`].
pub struct Mp4Rotator {
    stream_name: String,
    dir: PathBuf,
    policy: RotationPolicy,
    tracks: TrackSet,
    index: Arc<dyn RecordingIndex>,
    writers: Arc<WriterRegistry>,
    current: Option<ActiveFile>,
    cut_requested_at: Option<Instant>,
    retry_at: Option<Instant>,
    last_name: Option<String>,
    rotations: u64,
    forced_rotations: u64,
}

impl Mp4Rotator {
    /// Files go to `<root>/<stream_name>/`.
    pub fn new(
        stream_name: &str,
        root: &Path,
        policy: RotationPolicy,
        tracks: TrackSet,
        index: Arc<dyn RecordingIndex>,
        writers: Arc<WriterRegistry>,
    ) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            dir: root.join(stream_name),
            policy,
            tracks,
            index,
            writers,
            current: None,
            cut_requested_at: None,
            retry_at: None,
            last_name: None,
            rotations: 0,
            forced_rotations: 0,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|active| active.file.path())
    }

    #[must_use]
    pub const fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn rotations(&self) -> u64 {
        self.rotations
    }

    #[must_use]
    pub const fn forced_rotations(&self) -> u64 {
        self.forced_rotations
    }

    /// Cut the current file at the next key frame.
    pub fn request_cut(&mut self) {
        if self.current.is_some() && self.cut_requested_at.is_none() {
            self.cut_requested_at = Some(Instant::now());
        }
    }

    /// New codec parameters apply from the next file on.
    pub fn update_tracks(&mut self, tracks: TrackSet) {
        if tracks != self.tracks {
            debug!(stream = %self.stream_name, "MP4 track set changed, cutting at next key frame");
            self.tracks = tracks;
            self.request_cut();
        }
    }

    fn is_cut_point(&self, packet: &MediaPacket) -> bool {
        packet.is_key && (packet.kind == MediaKind::Video || self.tracks.video.is_none())
    }

    pub async fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), SessionError> {
        let now = Instant::now();
        let cut_point = self.is_cut_point(packet);
        let retry_due = self.retry_at.map_or(true, |at| now >= at);

        match self.current.as_ref() {
            None => {
                // Files start on a key frame.
                if !cut_point || !retry_due {
                    return Ok(());
                }
                match self.open(now).await {
                    Ok(active) => {
                        self.retry_at = None;
                        self.current = Some(active);
                    }
                    Err(e) => {
                        self.retry_at = Some(now + RETRY_DELAY);
                        return Err(e);
                    }
                }
            }
            Some(active) => {
                let decision = self
                    .policy
                    .decide(active.opened_at, self.cut_requested_at, now, cut_point);
                if let Some(reason) = decision {
                    if retry_due {
                        self.rotate(reason, now).await;
                    }
                }
            }
        }

        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };
        match active.file.write_packet(packet).await {
            Ok(()) => {}
            Err(Mp4Error::NonMonotonicTimestamp { track, ts, last }) => {
                warn!(
                    stream = %self.stream_name,
                    track, ts, last,
                    "Timestamp went backwards, starting a new MP4 file"
                );
                if !self.rotate(RotationReason::Discontinuity, now).await {
                    return Ok(());
                }
                if let Some(active) = self.current.as_mut() {
                    active.file.write_packet(packet).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.refresh_index(now).await;
        Ok(())
    }

    /// Upkeep while no packets arrive: refresh the index row and close a file
    /// that outlived its hard ceiling. The next key frame opens a new file.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let expired = self
            .current
            .as_ref()
            .is_some_and(|active| now.saturating_duration_since(active.opened_at) >= self.policy.hard_ceiling());
        if !expired {
            self.refresh_index(now).await;
            return;
        }

        warn!(
            stream = %self.stream_name,
            ceiling = ?self.policy.hard_ceiling(),
            "MP4 file reached hard duration ceiling without new packets, closing"
        );
        self.writers.unregister(&self.stream_name);
        self.cut_requested_at = None;
        if let Some(active) = self.current.take() {
            self.forced_rotations += 1;
            self.finish(active).await;
        }
    }

    async fn refresh_index(&mut self, now: Instant) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        if now.saturating_duration_since(active.last_index_update) < INDEX_UPDATE_INTERVAL {
            return;
        }
        active.last_index_update = now;
        let duration = now.saturating_duration_since(active.opened_at);
        if let Err(e) = self
            .index
            .update_recording(active.recording_id, duration, active.file.bytes_written())
            .await
        {
            warn!(stream = %self.stream_name, error = %e, "Failed to update recording row");
        }
    }

    fn next_path(&mut self) -> PathBuf {
        let base = recording_file_name(Utc::now());
        let mut name = base.clone();
        let mut suffix = 1;
        while self.last_name.as_deref().is_some_and(|last| name.as_str() <= last)
            || self.dir.join(&name).exists()
        {
            name = base.replace(".mp4", &format!("_{suffix}.mp4"));
            suffix += 1;
        }
        self.last_name = Some(name.clone());
        self.dir.join(name)
    }

    /// Create a file, add its row and register it as the stream's live writer.
    async fn open(&mut self, now: Instant) -> Result<ActiveFile, SessionError> {
        let path = self.next_path();
        let file = Mp4File::create(&path, &self.tracks).await?;
        let recording_id = match self
            .index
            .add_recording(&self.stream_name, file.path(), file.started_at())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                file.abandon().await;
                return Err(e.into());
            }
        };
        self.writers.register(
            &self.stream_name,
            WriterHandle {
                path: path.clone(),
                recording_id,
                started_at: file.started_at(),
            },
        );
        info!(stream = %self.stream_name, path = %path.display(), "Started MP4 recording");

        Ok(ActiveFile {
            file,
            recording_id,
            opened_at: now,
            last_index_update: now,
        })
    }

    /// Swap in a new file. The old one is closed only once its successor is
    /// registered; on failure it stays live and the cut is retried later.
    async fn rotate(&mut self, reason: RotationReason, now: Instant) -> bool {
        let age = self
            .current
            .as_ref()
            .map(|active| now.saturating_duration_since(active.opened_at));
        match reason {
            RotationReason::Forced => warn!(
                stream = %self.stream_name,
                ?age,
                "Forced MP4 rotation: no key frame within {:?}",
                self.policy.keyframe_grace
            ),
            RotationReason::HardCeiling => warn!(
                stream = %self.stream_name,
                ?age,
                ceiling = ?self.policy.hard_ceiling(),
                "MP4 file reached hard duration ceiling, rotating"
            ),
            _ => debug!(stream = %self.stream_name, ?reason, ?age, "Rotating MP4 file"),
        }

        let previous = self.writers.unregister(&self.stream_name);
        match self.open(now).await {
            Ok(next) => {
                self.cut_requested_at = None;
                self.retry_at = None;
                self.rotations += 1;
                if matches!(reason, RotationReason::Forced | RotationReason::HardCeiling) {
                    self.forced_rotations += 1;
                }
                if let Some(old) = self.current.replace(next) {
                    self.finish(old).await;
                }
                true
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.writers.register(&self.stream_name, previous);
                }
                self.retry_at = Some(now + RETRY_DELAY);
                warn!(stream = %self.stream_name, error = %e, "MP4 rotation failed, keeping current file");
                false
            }
        }
    }

    async fn finish(&self, active: ActiveFile) {
        let recording_id = active.recording_id;
        match active.file.finish().await {
            Ok(Some(summary)) => {
                info!(
                    stream = %self.stream_name,
                    path = %summary.path.display(),
                    duration = ?summary.stats.duration,
                    bytes = summary.stats.bytes,
                    "Finished MP4 recording"
                );
                if let Err(e) = self
                    .index
                    .finalize_recording(recording_id, summary.ended_at, summary.stats.duration, summary.stats.bytes)
                    .await
                {
                    warn!(stream = %self.stream_name, error = %e, "Failed to finalize recording row");
                }
            }
            Ok(None) => {
                if let Err(e) = self.index.discard_recording(recording_id).await {
                    debug!(stream = %self.stream_name, error = %e, "Failed to discard empty recording row");
                }
            }
            Err(e) => {
                warn!(stream = %self.stream_name, error = %e, "Failed to finish MP4 file");
                if let Err(e) = self.index.discard_recording(recording_id).await {
                    debug!(stream = %self.stream_name, error = %e, "Failed to discard recording row");
                }
            }
        }
    }

    /// Finish the current file and drop the live registration.
    pub async fn close(mut self) {
        self.writers.unregister(&self.stream_name);
        if let Some(active) = self.current.take() {
            self.finish(active).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryRecordingIndex;
    use bytes::Bytes;
    use nvr_mux::{h264::AvcDecoderConfig, VideoCodec, VideoTrack};

    const SEGMENT: Duration = Duration::from_secs(4);

    fn policy(factor: u32) -> RotationPolicy {
        RotationPolicy::new(SEGMENT, factor)
    }

    #[test]
    fn test_waits_for_key_frame_after_segment_duration() {
        let opened = Instant::now();
        let p = policy(2);
        assert_eq!(p.decide(opened, None, opened + Duration::from_secs(3), true), None);
        assert_eq!(p.decide(opened, None, opened + Duration::from_secs(4), false), None);
        assert_eq!(
            p.decide(opened, None, opened + Duration::from_millis(4500), true),
            Some(RotationReason::KeyFrame)
        );
    }

    #[test]
    fn test_forced_after_grace_without_key_frame() {
        let opened = Instant::now();
        let p = RotationPolicy::new(Duration::from_secs(10), 3);
        assert_eq!(p.decide(opened, None, opened + Duration::from_millis(14_900), false), None);
        assert_eq!(
            p.decide(opened, None, opened + Duration::from_secs(15), false),
            Some(RotationReason::Forced)
        );
    }

    #[test]
    fn test_hard_ceiling_beats_everything() {
        let opened = Instant::now();
        assert_eq!(
            policy(2).decide(opened, None, opened + Duration::from_secs(8), false),
            Some(RotationReason::HardCeiling)
        );
        // High-bitrate streams cut at the segment duration.
        assert_eq!(
            policy(1).decide(opened, None, opened + SEGMENT, false),
            Some(RotationReason::HardCeiling)
        );
        assert_eq!(policy(1).hard_ceiling(), SEGMENT);
    }

    #[test]
    fn test_requested_cut_uses_next_key_frame() {
        let opened = Instant::now();
        let requested = opened + Duration::from_secs(1);
        let p = policy(2);
        assert_eq!(p.decide(opened, Some(requested), requested, false), None);
        assert_eq!(
            p.decide(opened, Some(requested), requested + Duration::from_millis(200), true),
            Some(RotationReason::Requested)
        );
    }

    #[test]
    fn test_recording_file_name() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(recording_file_name(at), "recording_20260304_050607.mp4");
    }

    fn tracks() -> TrackSet {
        let config = AvcDecoderConfig::from_parameter_sets(&[0x67, 0x42, 0x00, 0x1E], &[0x68, 0xCE]).unwrap();
        TrackSet {
            video: Some(VideoTrack {
                codec: VideoCodec::H264,
                width: 640,
                height: 480,
                clock_rate: 90_000,
                extra_data: config.to_record(),
            }),
            audio: None,
        }
    }

    fn frame(pts: i64, key: bool) -> MediaPacket {
        let nal: &'static [u8] = if key { &[0, 0, 0, 1, 0x65, 0x88] } else { &[0, 0, 0, 1, 0x41, 0x9a] };
        MediaPacket::video(pts, 90_000, key, Bytes::from_static(nal))
    }

    fn rotator(dir: &Path, policy: RotationPolicy) -> (Mp4Rotator, Arc<MemoryRecordingIndex>, Arc<WriterRegistry>) {
        let index = Arc::new(MemoryRecordingIndex::new());
        let writers = Arc::new(WriterRegistry::new());
        let rotator = Mp4Rotator::new("cam", dir, policy, tracks(), index.clone(), writers.clone());
        (rotator, index, writers)
    }

    #[tokio::test]
    async fn test_first_file_starts_on_key_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rotator, index, writers) = rotator(dir.path(), policy(2));

        rotator.write_packet(&frame(0, false)).await.unwrap();
        assert!(!rotator.is_open());
        assert!(index.is_empty());

        rotator.write_packet(&frame(3000, true)).await.unwrap();
        rotator.write_packet(&frame(6000, false)).await.unwrap();
        assert!(rotator.is_open());
        let live = writers.writer("cam").unwrap();
        assert_eq!(Some(live.path.as_path()), rotator.current_path());
        assert!(live.path.starts_with(dir.path().join("cam")));

        rotator.close().await;
        assert!(writers.writer("cam").is_none());
        let rows = index.recordings("cam");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].complete);
        assert!(rows[0].path.exists());
    }

    #[tokio::test]
    async fn test_requested_cut_rotates_on_key_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rotator, index, _writers) = rotator(dir.path(), policy(2));

        rotator.write_packet(&frame(0, true)).await.unwrap();
        rotator.write_packet(&frame(3000, false)).await.unwrap();
        rotator.request_cut();
        rotator.write_packet(&frame(6000, false)).await.unwrap();
        assert_eq!(rotator.rotations(), 0);
        rotator.write_packet(&frame(9000, true)).await.unwrap();
        assert_eq!(rotator.rotations(), 1);
        assert_eq!(rotator.forced_rotations(), 0);
        rotator.close().await;

        let rows = index.recordings("cam");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.complete));
        // Names stay unique and ordered even within one second.
        assert!(rows[0].path < rows[1].path);
    }

    #[tokio::test]
    async fn test_backwards_timestamp_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rotator, index, _writers) = rotator(dir.path(), policy(2));

        rotator.write_packet(&frame(90_000, true)).await.unwrap();
        rotator.write_packet(&frame(93_000, false)).await.unwrap();
        rotator.write_packet(&frame(1, false)).await.unwrap();
        assert_eq!(rotator.rotations(), 1);
        rotator.close().await;
        assert_eq!(index.recordings("cam").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_keeps_index_current_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rotator, index, writers) = rotator(dir.path(), RotationPolicy::new(Duration::from_secs(60), 2));

        rotator.write_packet(&frame(0, true)).await.unwrap();
        rotator.write_packet(&frame(3000, false)).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        rotator.tick().await;
        let rows = index.recordings("cam");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].duration >= Duration::from_secs(31));
        assert!(rows[0].size_bytes > 0);
        assert!(!rows[0].complete);

        // Past the ceiling the idle file is finished rather than left open.
        tokio::time::advance(Duration::from_secs(90)).await;
        rotator.tick().await;
        assert!(!rotator.is_open());
        assert!(writers.writer("cam").is_none());
        assert_eq!(rotator.forced_rotations(), 1);
        let rows = index.recordings("cam");
        assert!(rows[0].complete);
        assert!(rows[0].path.exists());

        rotator.write_packet(&frame(400_000, true)).await.unwrap();
        assert!(rotator.is_open());
        rotator.close().await;
        assert_eq!(index.recordings("cam").len(), 2);
    }

    #[tokio::test]
    async fn test_hard_ceiling_rotation_is_counted_as_forced() {
        let dir = tempfile::tempdir().unwrap();
        let short = RotationPolicy::new(Duration::from_millis(20), 1);
        let (mut rotator, index, _writers) = rotator(dir.path(), short);

        rotator.write_packet(&frame(0, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        rotator.write_packet(&frame(3000, false)).await.unwrap();
        assert_eq!(rotator.rotations(), 1);
        assert_eq!(rotator.forced_rotations(), 1);
        rotator.close().await;
        assert_eq!(index.recordings("cam").len(), 2);
    }
}

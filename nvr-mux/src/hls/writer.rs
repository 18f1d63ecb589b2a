//! In-process HLS writer: MPEG-TS segments plus a sliding `index.m3u8`.

use {
    super::playlist::{referenced_segments, Playlist, SegmentInfo},
    crate::{
        aac::{self, AudioSpecificConfig},
        h264::{self, AvcDecoderConfig},
        mpegts::{
            define::{epsi_stream_type, MPEG_FLAG_IDR_FRAME},
            MpegTsError, TsMuxer,
        },
        packet::{rescale, AudioCodec, MediaKind, MediaPacket, TrackSet, VideoCodec},
    },
    bytes::Bytes,
    chrono::{DateTime, Utc},
    std::{
        collections::{HashSet, VecDeque},
        path::{Component, Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, info, warn},
};

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const MIN_SEGMENT_DURATION: f64 = 0.5;
pub const MAX_SEGMENT_DURATION: f64 = 10.0;
pub const DEFAULT_SEGMENT_DURATION: f64 = 2.0;
pub const MIN_LIST_SIZE: usize = 3;
pub const MAX_LIST_SIZE: usize = 5;
/// Segments kept on disk beyond the playlist window, for clients still fetching them.
pub const RETENTION_SLACK: usize = 2;

const TS_CLOCK: u32 = 90_000;
const DIRECTORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const CLOSE_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
const TRAILER_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TEST_NAME: &str = ".write_test";

#[derive(Debug, thiserror::Error)]
pub enum HlsWriterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mux error: {0}")]
    Mux(#[from] MpegTsError),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("output directory {0} is not usable")]
    DirectoryUnusable(PathBuf),

    #[error("no track can be written as HLS")]
    NoSupportedTracks,

    #[error("writer is closed")]
    Closed,
}

impl HlsWriterError {
    /// The caller should reset its DTS tracker (and [`HlsWriter::reset_timestamps`]).
    #[must_use]
    pub fn needs_dts_reset(&self) -> bool {
        match self {
            Self::Mux(e) => matches!(e, MpegTsError::NonMonotonicDts { .. }),
            Self::Io(e) => e.kind() == std::io::ErrorKind::InvalidInput,
            _ => false,
        }
    }

    /// The output directory vanished; it is recreated on the next packet.
    #[must_use]
    pub fn is_missing_directory(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[must_use]
pub fn clamp_segment_duration(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return DEFAULT_SEGMENT_DURATION;
    }
    seconds.clamp(MIN_SEGMENT_DURATION, MAX_SEGMENT_DURATION)
}

#[must_use]
pub fn clamp_list_size(size: usize) -> usize {
    size.clamp(MIN_LIST_SIZE, MAX_LIST_SIZE)
}

#[derive(Debug, Clone)]
pub struct HlsWriterOptions {
    /// Every output directory must live beneath this root.
    pub hls_root: PathBuf,
    /// Target segment length in seconds; clamped to 0.5..=10.
    pub segment_duration: f64,
    /// Playlist window; clamped to 3..=5.
    pub list_size: usize,
}

impl HlsWriterOptions {
    #[must_use]
    pub fn new(hls_root: impl Into<PathBuf>, segment_duration: f64, list_size: usize) -> Self {
        Self {
            hls_root: hls_root.into(),
            segment_duration: clamp_segment_duration(segment_duration),
            list_size: clamp_list_size(list_size),
        }
    }

    #[must_use]
    pub const fn max_segments_to_keep(&self) -> usize {
        self.list_size + RETENTION_SLACK
    }

    fn segment_ticks(&self) -> i64 {
        (self.segment_duration * f64::from(TS_CLOCK)) as i64
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Keep `dir` if it sits strictly beneath `root`, otherwise use `<root>/<stream>`.
#[must_use]
pub fn resolve_output_dir(dir: &Path, root: &Path, stream_name: &str) -> PathBuf {
    let root = normalize_lexically(root);
    let dir = normalize_lexically(dir);
    if dir != root && dir.starts_with(&root) {
        dir
    } else {
        root.join(stream_name)
    }
}

async fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(WRITE_TEST_NAME);
    tokio::fs::write(&probe, b"").await?;
    tokio::fs::remove_file(&probe).await
}

/// Make sure `dir` exists, is a directory and accepts new files.
/// One remediation (create, then chmod 0755) is attempted before giving up.
pub async fn ensure_writable_dir(dir: &Path) -> Result<(), HlsWriterError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if !meta.is_dir() => return Err(HlsWriterError::DirectoryUnusable(dir.to_path_buf())),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir).await?;
        }
        Err(e) => return Err(e.into()),
    }

    if probe_writable(dir).await.is_ok() {
        return Ok(());
    }

    warn!(dir = %dir.display(), "HLS directory not writable, attempting to fix permissions");
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::create_dir_all(dir).await;
        let _ = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await;
    }
    probe_writable(dir)
        .await
        .map_err(|_| HlsWriterError::DirectoryUnusable(dir.to_path_buf()))
}

/// Write data to `path` through a temporary file and an atomic rename,
/// retrying transient failures with exponential backoff (via `backon`).
///
/// Retries up to 3 times (100ms base, 2s max, with jitter).
async fn write_with_retry(path: &Path, data: Bytes) -> std::io::Result<()> {
    use backon::{BackoffBuilder, ExponentialBuilder};

    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
        .build();

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut last_err = None;
    for delay in std::iter::once(Duration::ZERO).chain(backoff) {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let attempt = async {
            tokio::fs::write(&tmp, &data).await?;
            tokio::fs::rename(&tmp, path).await
        };
        match attempt.await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if !is_transient_error(&e) {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e);
                }
                warn!("HLS write failed: {} - retrying in {:?}", e, delay);
                last_err = Some(e);
            }
        }
    }

    let _ = tokio::fs::remove_file(&tmp).await;
    Err(last_err.unwrap_or_else(|| std::io::Error::other("Retry exhausted")))
}

/// Check if an I/O error is transient and worth retrying
fn is_transient_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

fn is_segment_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "ts" || e == "m4s")
}

/// Delete the oldest `*.ts`/`*.m4s` files beyond `keep`, never touching a
/// file named in `protected` or in the directory's current playlist.
/// Returns the number of files removed.
pub async fn cleanup_old_segments(
    dir: &Path,
    keep: usize,
    protected: &HashSet<String>,
) -> std::io::Result<usize> {
    let mut referenced = protected.clone();
    if let Ok(m3u8) = tokio::fs::read_to_string(dir.join(PLAYLIST_NAME)).await {
        referenced.extend(referenced_segments(&m3u8));
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_segment_file(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        files.push((modified, name));
    }

    files.sort();
    let excess = files.len().saturating_sub(keep);
    let mut removed = 0;
    for (_, name) in files {
        if removed >= excess {
            break;
        }
        if referenced.contains(&name) {
            continue;
        }
        match tokio::fs::remove_file(dir.join(&name)).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %name, error = %e, "Failed to remove old HLS segment"),
        }
    }
    Ok(removed)
}

struct MuxState {
    ts_muxer: TsMuxer,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    avc_config: Option<AvcDecoderConfig>,
    aac_config: Option<AudioSpecificConfig>,

    playlist: Playlist,
    retired: VecDeque<String>,
    sequence: u64,

    waiting_for_key: bool,
    segment_start_dts: Option<i64>,
    segment_started_at: DateTime<Utc>,
    last_dts: Option<i64>,
    last_frame_ticks: i64,
    pending_discontinuity: bool,

    output_dir: PathBuf,
    recreate_dir: bool,
    last_dir_check: Option<Instant>,
    last_cleanup: Instant,
}

impl MuxState {
    fn new(output_dir: PathBuf, options: &HlsWriterOptions, tracks: &TrackSet) -> Result<Self, HlsWriterError> {
        let mut ts_muxer = TsMuxer::new();

        let mut video_pid = None;
        let mut avc_config = None;
        if let Some(video) = &tracks.video {
            if video.codec == VideoCodec::H264 {
                video_pid = Some(ts_muxer.add_stream(epsi_stream_type::PSI_STREAM_H264)?);
                avc_config = AvcDecoderConfig::parse(&video.extra_data).ok();
            } else {
                warn!(codec = ?video.codec, "Video codec not supported for HLS, skipping video");
            }
        }

        let mut audio_pid = None;
        let mut aac_config = None;
        if let Some(audio) = &tracks.audio {
            match (&audio.codec, AudioSpecificConfig::parse(&audio.extra_data)) {
                (AudioCodec::Aac, Ok(config)) => {
                    audio_pid = Some(ts_muxer.add_stream(epsi_stream_type::PSI_STREAM_AAC)?);
                    aac_config = Some(config);
                }
                (codec, _) => debug!(codec = ?codec, "Audio not muxable into HLS, skipping audio"),
            }
        }

        if video_pid.is_none() && audio_pid.is_none() {
            return Err(HlsWriterError::NoSupportedTracks);
        }

        Ok(Self {
            ts_muxer,
            waiting_for_key: video_pid.is_some(),
            video_pid,
            audio_pid,
            avc_config,
            aac_config,
            playlist: Playlist::new(options.list_size, (options.segment_duration * 1000.0) as i64),
            retired: VecDeque::new(),
            sequence: 0,
            segment_start_dts: None,
            segment_started_at: Utc::now(),
            last_dts: None,
            last_frame_ticks: 0,
            pending_discontinuity: true,
            output_dir,
            recreate_dir: false,
            last_dir_check: None,
            last_cleanup: Instant::now(),
        })
    }

    async fn maintain_directory(&mut self, stream_name: &str, options: &HlsWriterOptions) -> Result<(), HlsWriterError> {
        if self.recreate_dir {
            tokio::fs::create_dir_all(&self.output_dir).await?;
            self.recreate_dir = false;
            info!(stream = stream_name, dir = %self.output_dir.display(), "Recreated HLS output directory");
        }

        if self
            .last_dir_check
            .is_some_and(|at| at.elapsed() < DIRECTORY_CHECK_INTERVAL)
        {
            return Ok(());
        }
        self.last_dir_check = Some(Instant::now());

        let resolved = resolve_output_dir(&self.output_dir, &options.hls_root, stream_name);
        if resolved != self.output_dir {
            debug!(stream = stream_name, from = %self.output_dir.display(), to = %resolved.display(), "Redirecting HLS output under storage root");
            self.output_dir = resolved;
        }
        ensure_writable_dir(&self.output_dir).await
    }

    async fn write(&mut self, packet: &MediaPacket, options: &HlsWriterOptions) -> Result<(), HlsWriterError> {
        let (pid, is_video) = match packet.kind {
            MediaKind::Video => (self.video_pid, true),
            MediaKind::Audio => (self.audio_pid, false),
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        if self.waiting_for_key && !(is_video && packet.is_key) {
            return Ok(());
        }

        let dts = packet
            .decode_ts()
            .ok_or_else(|| HlsWriterError::InvalidData("packet without timestamp".to_string()))?;
        let pts = packet.pts.unwrap_or(dts);
        let dts = rescale(dts, packet.time_base, TS_CLOCK);
        let pts = rescale(pts, packet.time_base, TS_CLOCK).max(dts);

        // Cut on video key frames, or on any frame for audio-only output.
        // A failed cut loses the closed segment only; this key frame still
        // opens the next one and the error is reported after muxing it.
        let cut_point = if self.video_pid.is_some() { is_video && packet.is_key } else { true };
        let mut cut_error = None;
        if cut_point {
            if let Some(start) = self.segment_start_dts {
                if dts - start >= options.segment_ticks() {
                    cut_error = self.finalize_segment(dts).await.err();
                }
            }
        }

        let payload = if is_video {
            h264::to_annex_b_access_unit(&packet.data, self.avc_config.as_ref(), packet.is_key)
                .map_err(|e| HlsWriterError::InvalidData(e.to_string()))?
        } else if aac::is_adts(&packet.data) {
            bytes::BytesMut::from(&packet.data[..])
        } else {
            let config = self
                .aac_config
                .ok_or_else(|| HlsWriterError::InvalidData("missing AAC config".to_string()))?;
            config
                .to_adts(&packet.data)
                .map_err(|e| HlsWriterError::InvalidData(e.to_string()))?
        };

        let flags = if is_video && packet.is_key { MPEG_FLAG_IDR_FRAME } else { 0 };
        self.ts_muxer.write(pid, pts, dts, flags, &payload)?;
        if is_video && packet.is_key {
            self.waiting_for_key = false;
        }

        if self.segment_start_dts.is_none() {
            self.segment_start_dts = Some(dts);
            self.segment_started_at = Utc::now();
        }
        match self.last_dts {
            Some(last) if dts > last => {
                self.last_frame_ticks = dts - last;
                self.last_dts = Some(dts);
            }
            Some(_) => {}
            None => self.last_dts = Some(dts),
        }
        cut_error.map_or(Ok(()), Err)
    }

    async fn finalize_segment(&mut self, end_dts: i64) -> Result<(), HlsWriterError> {
        let Some(start) = self.segment_start_dts.take() else {
            return Ok(());
        };
        let data = self.ts_muxer.get_data();
        self.ts_muxer.reset();
        if data.is_empty() {
            return Ok(());
        }

        let ts_name = format!("segment_{}.ts", self.sequence);
        let duration_ms = ((end_dts - start).max(0) / 90).max(1);

        if let Err(e) = write_with_retry(&self.output_dir.join(&ts_name), data.freeze()).await {
            warn!(segment = %ts_name, error = %e, "HLS segment write failed");
            self.pending_discontinuity = true;
            // the next segment must open on a key frame
            self.waiting_for_key = self.video_pid.is_some();
            if e.kind() == std::io::ErrorKind::NotFound {
                self.recreate_dir = true;
            }
            return Err(e.into());
        }

        let segment = SegmentInfo {
            sequence: self.sequence,
            duration: duration_ms,
            ts_name,
            discontinuity: self.pending_discontinuity,
            program_date_time: self.segment_started_at,
        };
        self.sequence += 1;
        self.pending_discontinuity = false;

        if let Some(evicted) = self.playlist.push(segment) {
            self.retired.push_back(evicted.ts_name);
        }
        self.write_playlist().await?;

        // delete_segments: drop files once they fall RETENTION_SLACK behind the window
        while self.retired.len() > RETENTION_SLACK {
            if let Some(name) = self.retired.pop_front() {
                if let Err(e) = tokio::fs::remove_file(self.output_dir.join(&name)).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        debug!(segment = %name, error = %e, "Failed to remove retired segment");
                    }
                }
            }
        }
        Ok(())
    }

    async fn write_playlist(&mut self) -> Result<(), HlsWriterError> {
        let m3u8 = self.playlist.generate_m3u8(str::to_string);
        write_with_retry(&self.output_dir.join(PLAYLIST_NAME), Bytes::from(m3u8)).await?;
        Ok(())
    }

    async fn maybe_cleanup(&mut self, stream_name: &str, options: &HlsWriterOptions) {
        if self.last_cleanup.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        self.last_cleanup = Instant::now();

        let protected = self
            .playlist
            .segment_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        match cleanup_old_segments(&self.output_dir, options.max_segments_to_keep(), &protected).await {
            Ok(0) => {}
            Ok(n) => debug!(stream = stream_name, removed = n, "Cleaned up old HLS segments"),
            Err(e) => warn!(stream = stream_name, error = %e, "HLS segment cleanup failed"),
        }
    }

    /// Flush the open segment and mark the playlist ended.
    async fn finish(&mut self) -> Result<(), HlsWriterError> {
        if let Some(last) = self.last_dts {
            self.finalize_segment(last + self.last_frame_ticks).await?;
        }
        self.playlist.is_ended = true;
        if !self.playlist.segments.is_empty() {
            self.write_playlist().await?;
        }
        Ok(())
    }
}

/// Per-stream HLS writer.
///
/// Owned by a media session. `close` consumes the writer; dropping it without
/// closing discards the open segment but leaves the playlist consistent.
pub struct HlsWriter {
    stream_name: String,
    options: HlsWriterOptions,
    closed: AtomicBool,
    state: Mutex<Option<MuxState>>,
}

impl HlsWriter {
    pub async fn create(
        output_dir: impl AsRef<Path>,
        stream_name: &str,
        options: HlsWriterOptions,
        tracks: &TrackSet,
    ) -> Result<Self, HlsWriterError> {
        let options = HlsWriterOptions::new(options.hls_root, options.segment_duration, options.list_size);
        let dir = resolve_output_dir(output_dir.as_ref(), &options.hls_root, stream_name);
        if dir != normalize_lexically(output_dir.as_ref()) {
            debug!(stream = stream_name, dir = %dir.display(), "HLS output redirected under storage root");
        }
        ensure_writable_dir(&dir).await?;

        let state = MuxState::new(dir.clone(), &options, tracks)?;
        info!(
            stream = stream_name,
            dir = %dir.display(),
            segment_duration = options.segment_duration,
            list_size = options.list_size,
            "HLS writer created"
        );

        Ok(Self {
            stream_name: stream_name.to_string(),
            options,
            closed: AtomicBool::new(false),
            state: Mutex::new(Some(state)),
        })
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    #[must_use]
    pub const fn options(&self) -> &HlsWriterOptions {
        &self.options
    }

    pub async fn output_dir(&self) -> Option<PathBuf> {
        self.state.lock().await.as_ref().map(|s| s.output_dir.clone())
    }

    /// Mux one normalized packet.
    ///
    /// Invalid data is logged and swallowed so one bad packet does not end the
    /// session. Errors for which [`HlsWriterError::needs_dts_reset`] holds ask
    /// the caller to reset its timestamp tracking.
    pub async fn write_packet(&self, packet: &MediaPacket) -> Result<(), HlsWriterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HlsWriterError::Closed);
        }
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(HlsWriterError::Closed)?;

        state.maintain_directory(&self.stream_name, &self.options).await?;

        let result = match state.write(packet, &self.options).await {
            Err(HlsWriterError::InvalidData(reason)) => {
                warn!(stream = %self.stream_name, %reason, "Dropping invalid packet");
                Ok(())
            }
            Err(e) if e.is_missing_directory() => {
                state.recreate_dir = true;
                Err(e)
            }
            other => other,
        };

        state.maybe_cleanup(&self.stream_name, &self.options).await;
        result
    }

    /// Forget timestamp history after the caller reset its DTS tracker.
    /// The next segment is flagged as a discontinuity.
    pub async fn reset_timestamps(&self) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.ts_muxer.reset_timestamps();
            state.last_dts = None;
            state.segment_start_dts = None;
            state.pending_discontinuity = true;
        }
    }

    /// Flush the last segment and finish the playlist.
    ///
    /// Waits at most 3 s for in-flight writes and 5 s for the final flush;
    /// past either deadline the writer is closed without flushing.
    pub async fn close(self) {
        self.closed.store(true, Ordering::Release);

        let state = match tokio::time::timeout(CLOSE_LOCK_TIMEOUT, self.state.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!(stream = %self.stream_name, "Timed out waiting for HLS writer, force closing");
                None
            }
        };

        if let Some(mut state) = state {
            match tokio::time::timeout(TRAILER_TIMEOUT, state.finish()).await {
                Ok(Ok(())) => info!(stream = %self.stream_name, "HLS writer closed"),
                Ok(Err(e)) => warn!(stream = %self.stream_name, error = %e, "Failed to flush final HLS segment"),
                Err(_) => warn!(stream = %self.stream_name, "HLS trailer write timed out"),
            }
        }
    }
}

impl Drop for HlsWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && self.state.get_mut().is_some() {
            debug!(stream = %self.stream_name, "HLS writer dropped without close, discarding open segment");
        }
    }
}

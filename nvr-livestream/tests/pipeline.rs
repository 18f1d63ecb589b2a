// Full packet pipeline: scripted source -> normalizer -> HLS + MP4 on disk.

use async_trait::async_trait;
use bytes::Bytes;
use nvr_core::{StreamState, StreamStateTable};
use nvr_livestream::{
    MediaSession, MemoryRecordingIndex, Outputs, PacketSource, RotationPolicy, SessionConfig, SessionDeps,
    SessionError, SourceError, SourceEvent, SourceOpener, TimestampNormalizer, UpstreamLocator, WriterRegistry,
};
use nvr_mux::{
    h264::AvcDecoderConfig,
    hls::{playlist::referenced_segments, HlsWriterOptions},
    MediaKind, MediaPacket, TrackSet, VideoCodec, VideoTrack,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, path::Path, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00];
const SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02];

fn tracks() -> TrackSet {
    let config = AvcDecoderConfig::from_parameter_sets(&[0x67, 0x42, 0x00, 0x1E], &[0x68, 0xCE]).unwrap();
    TrackSet {
        video: Some(VideoTrack {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            clock_rate: 90_000,
            extra_data: config.to_record(),
        }),
        audio: None,
    }
}

fn frame(pts: Option<i64>, key: bool) -> MediaPacket {
    MediaPacket {
        kind: MediaKind::Video,
        pts,
        dts: None,
        time_base: 90_000,
        is_key: key,
        data: Bytes::from_static(if key { IDR } else { SLICE }),
    }
}

struct ChannelSource {
    tracks: TrackSet,
    rx: mpsc::Receiver<SourceEvent>,
}

#[async_trait]
impl PacketSource for ChannelSource {
    fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    fn video_frame_duration(&self) -> Option<i64> {
        Some(3000)
    }

    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        Ok(self.rx.recv().await)
    }
}

#[derive(Default)]
struct ChannelOpener {
    pending: Mutex<VecDeque<mpsc::Receiver<SourceEvent>>>,
}

impl ChannelOpener {
    fn feed(&self) -> mpsc::Sender<SourceEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.pending.lock().push_back(rx);
        tx
    }
}

#[async_trait]
impl SourceOpener for ChannelOpener {
    async fn open(&self, _url: &str, _record_audio: bool) -> Result<Box<dyn PacketSource>, SourceError> {
        let rx = self
            .pending
            .lock()
            .pop_front()
            .ok_or_else(|| SourceError::Closed("camera offline".into()))?;
        Ok(Box::new(ChannelSource { tracks: tracks(), rx }))
    }
}

struct StaticLocator;

#[async_trait]
impl UpstreamLocator for StaticLocator {
    async fn locate(&self, stream_name: &str) -> Result<String, SessionError> {
        Ok(format!("rtsp://localhost:8554/{stream_name}"))
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn assert_playlist_consistent(dir: &Path) -> usize {
    let m3u8 = std::fs::read_to_string(dir.join("index.m3u8")).unwrap();
    let listed = referenced_segments(&m3u8);
    assert!(!listed.is_empty());
    for name in &listed {
        assert!(dir.join(name).exists(), "listed segment {name} missing");
    }
    listed.len()
}

#[tokio::test]
async fn test_pipeline_survives_timestamp_anomalies() {
    let dir = tempfile::tempdir().unwrap();
    let opener = Arc::new(ChannelOpener::default());
    let index = Arc::new(MemoryRecordingIndex::new());
    let writers = Arc::new(WriterRegistry::new());
    let states = StreamStateTable::new();
    let deps = SessionDeps {
        locator: Arc::new(StaticLocator),
        opener: opener.clone(),
        index: index.clone(),
        writers: writers.clone(),
        states: states.clone(),
    };
    let config = SessionConfig::new(
        "driveway",
        HlsWriterOptions::new(dir.path().join("hls"), 1.0, 5),
        dir.path().join("mp4"),
        RotationPolicy::new(Duration::from_secs(600), 2),
    );

    let feed = opener.feed();
    let cancel = CancellationToken::new();
    let handle = MediaSession::spawn(config, deps, Outputs { hls: true, mp4: true }, &cancel);

    let mut sent = 0;
    for i in 0..90i64 {
        let pts = match i {
            // Camera clock steps backwards mid-GOP.
            45 => Some(10),
            // Timestamps missing entirely.
            50 | 51 => None,
            _ => Some(i * 3000),
        };
        feed.send(SourceEvent::Packet(frame(pts, i % 30 == 0))).await.unwrap();
        sent += 1;
        if i == 20 {
            // Audio is not recorded for this stream and must be skipped.
            let audio = MediaPacket::audio(i * 1600, 48_000, Bytes::from_static(&[0x21, 0x00]));
            feed.send(SourceEvent::Packet(audio)).await.unwrap();
        }
    }

    wait_until("all frames written", || handle.stats().packets == sent).await;
    assert_eq!(states.state("driveway"), StreamState::Active);
    assert_eq!(handle.stats().dropped, 0);
    handle.stop().await;

    let segments = assert_playlist_consistent(&dir.path().join("hls/driveway"));
    assert!(segments >= 2, "expected several segments, got {segments}");

    // Repaired timestamps never force a discontinuity cut.
    let rows = index.recordings("driveway");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].complete);
    assert!(rows[0].path.exists());
    assert!(rows[0].size_bytes > 0);
    assert!(writers.writer("driveway").is_none());
    drop(feed);
}

#[tokio::test]
async fn test_reconnect_keeps_mp4_open_until_next_key_frame() {
    let dir = tempfile::tempdir().unwrap();
    let opener = Arc::new(ChannelOpener::default());
    let index = Arc::new(MemoryRecordingIndex::new());
    let writers = Arc::new(WriterRegistry::new());
    let deps = SessionDeps {
        locator: Arc::new(StaticLocator),
        opener: opener.clone(),
        index: index.clone(),
        writers: writers.clone(),
        states: StreamStateTable::new(),
    };
    let config = SessionConfig::new(
        "porch",
        HlsWriterOptions::new(dir.path().join("hls"), 1.0, 3),
        dir.path().join("mp4"),
        RotationPolicy::new(Duration::from_secs(600), 2),
    );

    let first = opener.feed();
    let second = opener.feed();
    let cancel = CancellationToken::new();
    let handle = MediaSession::spawn(config, deps, Outputs { hls: true, mp4: true }, &cancel);

    for i in 0..30i64 {
        first.send(SourceEvent::Packet(frame(Some(i * 3000), i == 0))).await.unwrap();
    }
    wait_until("first feed written", || handle.stats().packets == 30).await;
    let first_file = writers.writer("porch").unwrap();

    // Health monitor restart path.
    assert!(writers.signal_reconnect("porch"));
    wait_until("reconnect", || handle.stats().reconnects == 1).await;

    // The new upstream restarts its clock at zero.
    for i in 0..30i64 {
        second.send(SourceEvent::Packet(frame(Some(i * 3000), i == 0))).await.unwrap();
    }
    wait_until("second feed written", || handle.stats().packets == 60).await;
    let second_file = writers.writer("porch").unwrap();
    assert_ne!(first_file.recording_id, second_file.recording_id);

    cancel.cancel();
    handle.stop().await;

    let rows = index.recordings("porch");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.complete && r.path.exists()));
    assert!(rows[0].path < rows[1].path || rows[0].started_at <= rows[1].started_at);
    assert_playlist_consistent(&dir.path().join("hls/porch"));
}

#[test]
fn test_normalizer_output_is_monotonic() {
    let mut normalizer = TimestampNormalizer::new(&tracks(), Some(3000));
    let inputs = [
        (None, None),
        (Some(3000), Some(3000)),
        (Some(9000), Some(6000)),
        (Some(1000), Some(1000)),
        (Some(-5), None),
        (None, Some(12_000)),
        (Some(900_000), Some(15_000)),
        (Some(i64::from(i32::MAX) + 10), Some(i64::from(i32::MAX) + 10)),
        (Some(30), Some(30)),
    ];

    let mut last = i64::MIN;
    for (pts, dts) in inputs {
        let mut packet = frame(pts, false);
        packet.dts = dts;
        let rebased = normalizer.normalize(&mut packet).is_rebased();
        let (pts, dts) = (packet.pts.unwrap(), packet.dts.unwrap());
        if rebased {
            last = i64::MIN;
        }
        assert!(dts >= last, "dts {dts} after {last}");
        assert!(dts > 0);
        assert!(pts >= dts);
        assert!(pts - dts <= 5 * 90_000);
        last = dts;
    }
}

//! Per-camera media session: one packet source fanned out to the HLS writer
//! and the MP4 rotator, with the timestamp normalizer in line.

use {
    crate::{
        error::SessionError,
        index::RecordingIndex,
        normalizer::TimestampNormalizer,
        rotator::{Mp4Rotator, RotationPolicy},
        source::{SourceEvent, SourceOpener},
        writers::{SessionSignals, WriterRegistry},
    },
    async_trait::async_trait,
    backon::{BackoffBuilder, ExponentialBuilder},
    nvr_core::{ErrorKind, StreamState, StreamStateTable},
    nvr_mux::{
        hls::{HlsWriter, HlsWriterOptions},
        MediaKind, MediaPacket, TrackSet,
    },
    std::{path::PathBuf, sync::Arc, time::Duration},
    tokio::{
        sync::watch,
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, info_span, warn, Instrument},
};

/// No packets for this long after the grace window means the upstream is stuck.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const LIVENESS_GRACE: Duration = Duration::from_secs(30);
/// A packet taking longer than this to write puts the session in drop mode.
pub const SLOW_WRITE: Duration = Duration::from_millis(500);
const WATCHDOG_TICK: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which outputs a session is currently feeding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outputs {
    pub hls: bool,
    pub mp4: bool,
}

impl Outputs {
    #[must_use]
    pub const fn any(self) -> bool {
        self.hls || self.mp4
    }
}

/// Finds the upstream a session reads from, making sure it exists first.
#[async_trait]
pub trait UpstreamLocator: Send + Sync {
    async fn locate(&self, stream_name: &str) -> Result<String, SessionError>;
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stream_name: String,
    pub record_audio: bool,
    pub hls: HlsWriterOptions,
    /// Requested HLS output directory; redirected under the HLS root when outside it.
    pub hls_dir: PathBuf,
    pub mp4_root: PathBuf,
    pub rotation: RotationPolicy,
    pub liveness_grace: Duration,
    pub liveness_timeout: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new(stream_name: &str, hls: HlsWriterOptions, mp4_root: PathBuf, rotation: RotationPolicy) -> Self {
        let hls_dir = hls.hls_root.join(stream_name);
        Self {
            stream_name: stream_name.to_string(),
            record_audio: false,
            hls,
            hls_dir,
            mp4_root,
            rotation,
            liveness_grace: LIVENESS_GRACE,
            liveness_timeout: LIVENESS_TIMEOUT,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub locator: Arc<dyn UpstreamLocator>,
    pub opener: Arc<dyn SourceOpener>,
    pub index: Arc<dyn RecordingIndex>,
    pub writers: Arc<WriterRegistry>,
    pub states: StreamStateTable,
}

#[derive(Debug)]
enum ReconnectReason {
    Requested,
    EndOfStream,
    Stalled,
    Failed(SessionError),
}

#[derive(Debug)]
enum PumpExit {
    Cancelled,
    OutputsClosed,
    Reconnect { reason: ReconnectReason, streamed: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

pub struct MediaSession {
    config: SessionConfig,
    deps: SessionDeps,
    outputs: watch::Receiver<Outputs>,
    signals: Arc<SessionSignals>,
    cancel_token: CancellationToken,
    stats_tx: watch::Sender<SessionStats>,

    hls: Option<HlsWriter>,
    rotator: Option<Mp4Rotator>,
    normalizer: Option<TimestampNormalizer>,
    tracks: TrackSet,
    dropping_until_key: bool,
    active: bool,
    stats: SessionStats,
}

/// Owner side of a running session.
pub struct SessionHandle {
    stream_name: String,
    outputs: watch::Sender<Outputs>,
    stats: watch::Receiver<SessionStats>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    #[must_use]
    pub fn outputs(&self) -> Outputs {
        *self.outputs.borrow()
    }

    pub fn set_hls(&self, enabled: bool) {
        self.outputs.send_if_modified(|o| std::mem::replace(&mut o.hls, enabled) != enabled);
    }

    pub fn set_mp4(&self, enabled: bool) {
        self.outputs.send_if_modified(|o| std::mem::replace(&mut o.mp4, enabled) != enabled);
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        *self.stats.borrow()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait (bounded) for writers to close. A session that misses
    /// the deadline is left to finish on its own.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.task).await {
            Ok(Ok(())) => debug!(stream = %self.stream_name, "Media session joined"),
            Ok(Err(e)) => error!(stream = %self.stream_name, error = %e, "Media session task failed"),
            Err(_) => warn!(stream = %self.stream_name, "Media session did not stop within {:?}", STOP_TIMEOUT),
        }
    }
}

impl MediaSession {
    /// Start a session task under `parent`.
    pub fn spawn(config: SessionConfig, deps: SessionDeps, outputs: Outputs, parent: &CancellationToken) -> SessionHandle {
        let (outputs_tx, outputs_rx) = watch::channel(outputs);
        let (stats_tx, stats_rx) = watch::channel(SessionStats::default());
        let cancel_token = parent.child_token();
        let signals = deps.writers.attach(&config.stream_name);
        let stream_name = config.stream_name.clone();

        let session = Self {
            config,
            deps,
            outputs: outputs_rx,
            signals,
            cancel_token: cancel_token.clone(),
            stats_tx,
            hls: None,
            rotator: None,
            normalizer: None,
            tracks: TrackSet::default(),
            dropping_until_key: false,
            active: false,
            stats: SessionStats::default(),
        };
        let span = info_span!("media_session", stream = %stream_name);
        let task = tokio::spawn(session.run().instrument(span));

        SessionHandle {
            stream_name,
            outputs: outputs_tx,
            stats: stats_rx,
            cancel_token,
            task,
        }
    }

    fn name(&self) -> &str {
        &self.config.stream_name
    }

    fn wanted(&self) -> Outputs {
        *self.outputs.borrow()
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats);
    }

    async fn run(mut self) {
        info!("Media session started");
        self.deps.states.set_state(self.name(), StreamState::Starting);
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(self.config.reconnect_min_delay)
            .with_max_delay(self.config.reconnect_max_delay)
            .with_jitter()
            .without_max_times();
        let mut backoff = backoff_builder.build();

        loop {
            if self.cancel_token.is_cancelled() || !self.wanted().any() {
                break;
            }

            let (reason, streamed) = match self.connect_and_pump().await {
                PumpExit::Cancelled | PumpExit::OutputsClosed => break,
                PumpExit::Reconnect { reason, streamed } => (reason, streamed),
            };

            self.stats.reconnects += 1;
            self.publish_stats();
            self.active = false;
            let attempt = self.deps.states.record_reconnect_attempt(self.name());
            if streamed {
                backoff = backoff_builder.build();
            }

            let delay = match reason {
                ReconnectReason::Requested => {
                    info!(attempt, "Reconnecting on request");
                    None
                }
                ReconnectReason::EndOfStream => {
                    warn!(attempt, "Upstream ended, reconnecting");
                    backoff.next()
                }
                ReconnectReason::Stalled => {
                    warn!(
                        attempt,
                        "No packets for over {:?}, restarting upstream feed",
                        self.config.liveness_timeout
                    );
                    None
                }
                ReconnectReason::Failed(e) => {
                    match e.kind() {
                        ErrorKind::Fatal | ErrorKind::Contention => {
                            error!(attempt, error = %e, "Media session error");
                            self.deps.states.set_state(self.name(), StreamState::Error);
                        }
                        _ => warn!(attempt, error = %e, "Media session interrupted, reconnecting"),
                    }
                    backoff.next()
                }
            };

            self.prepare_reconnect().await;

            if let Some(delay) = delay {
                tokio::select! {
                    () = self.cancel_token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.shutdown().await;
    }

    async fn connect_and_pump(&mut self) -> PumpExit {
        let cancel_token = self.cancel_token.clone();
        let locator = self.deps.locator.clone();
        let opener = self.deps.opener.clone();
        let name = self.config.stream_name.clone();

        let url = tokio::select! {
            () = cancel_token.cancelled() => return PumpExit::Cancelled,
            located = locator.locate(&name) => match located {
                Ok(url) => url,
                Err(e) => return PumpExit::Reconnect { reason: ReconnectReason::Failed(e), streamed: false },
            },
        };

        let mut source = tokio::select! {
            () = cancel_token.cancelled() => return PumpExit::Cancelled,
            opened = opener.open(&url, self.config.record_audio) => match opened {
                Ok(source) => source,
                Err(e) => return PumpExit::Reconnect { reason: ReconnectReason::Failed(e.into()), streamed: false },
            },
        };
        debug!(url = %url, "Upstream opened");

        let tracks = source.tracks().clone();
        if let Err(e) = self.on_connected(tracks, source.video_frame_duration()).await {
            return PumpExit::Reconnect { reason: ReconnectReason::Failed(e), streamed: false };
        }

        let signals = self.signals.clone();
        let connected_at = Instant::now();
        let mut streamed = false;
        let mut watchdog = tokio::time::interval_at(connected_at + WATCHDOG_TICK, WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => return PumpExit::Cancelled,
                () = signals.reconnect_requested() => {
                    return PumpExit::Reconnect { reason: ReconnectReason::Requested, streamed };
                }
                changed = self.outputs.changed() => {
                    if changed.is_err() {
                        return PumpExit::OutputsClosed;
                    }
                    if let Err(e) = self.apply_outputs().await {
                        return PumpExit::Reconnect { reason: ReconnectReason::Failed(e), streamed };
                    }
                    if !self.wanted().any() {
                        return PumpExit::OutputsClosed;
                    }
                }
                _ = watchdog.tick() => {
                    if let Some(rotator) = self.rotator.as_mut() {
                        rotator.tick().await;
                    }
                    if self.is_stalled(connected_at) {
                        return PumpExit::Reconnect { reason: ReconnectReason::Stalled, streamed };
                    }
                }
                event = source.next_event() => match event {
                    Ok(Some(event)) => {
                        if let Err(e) = self.handle_event(event, &mut streamed).await {
                            return PumpExit::Reconnect { reason: ReconnectReason::Failed(e), streamed };
                        }
                    }
                    Ok(None) => return PumpExit::Reconnect { reason: ReconnectReason::EndOfStream, streamed },
                    Err(e) => {
                        return PumpExit::Reconnect { reason: ReconnectReason::Failed(e.into()), streamed };
                    }
                },
            }
        }
    }

    /// Adopt the new source's tracks, keep timelines continuous and make sure
    /// the wanted writers exist.
    async fn on_connected(&mut self, tracks: TrackSet, frame_duration: Option<i64>) -> Result<(), SessionError> {
        match self.normalizer.as_mut() {
            None => self.normalizer = Some(TimestampNormalizer::new(&tracks, frame_duration)),
            Some(normalizer) => normalizer.splice(),
        }

        if self.tracks != tracks && !self.tracks.is_empty() {
            info!("Upstream track set changed, reopening HLS output");
            if let Some(hls) = self.hls.take() {
                hls.close().await;
            }
        }
        if let Some(rotator) = self.rotator.as_mut() {
            rotator.update_tracks(tracks.clone());
            rotator.request_cut();
        }
        self.tracks = tracks;
        self.dropping_until_key = false;
        self.apply_outputs().await
    }

    /// Open or close writers to match the wanted outputs.
    async fn apply_outputs(&mut self) -> Result<(), SessionError> {
        let wanted = self.wanted();

        if wanted.hls && self.hls.is_none() && !self.tracks.is_empty() {
            let writer = HlsWriter::create(&self.config.hls_dir, self.name(), self.config.hls.clone(), &self.tracks).await?;
            self.hls = Some(writer);
        } else if !wanted.hls {
            if let Some(hls) = self.hls.take() {
                hls.close().await;
            }
        }

        if wanted.mp4 && self.rotator.is_none() && !self.tracks.is_empty() {
            self.rotator = Some(Mp4Rotator::new(
                self.name(),
                &self.config.mp4_root,
                self.config.rotation,
                self.tracks.clone(),
                self.deps.index.clone(),
                self.deps.writers.clone(),
            ));
        } else if !wanted.mp4 {
            if let Some(rotator) = self.rotator.take() {
                rotator.close().await;
            }
        }
        Ok(())
    }

    fn is_stalled(&self, connected_at: Instant) -> bool {
        let now = Instant::now();
        if now.saturating_duration_since(connected_at) < self.config.liveness_grace {
            return false;
        }
        let last = self
            .signals
            .last_packet_at()
            .filter(|at| *at >= connected_at)
            .unwrap_or(connected_at);
        now.saturating_duration_since(last) > self.config.liveness_timeout
    }

    async fn handle_event(&mut self, event: SourceEvent, streamed: &mut bool) -> Result<(), SessionError> {
        match event {
            SourceEvent::Packet(packet) => {
                *streamed = true;
                self.process_packet(packet).await
            }
            SourceEvent::Pressure => {
                if !self.dropping_until_key {
                    debug!("Upstream under pressure, dropping non-key video until next key frame");
                }
                self.dropping_until_key = true;
                Ok(())
            }
            SourceEvent::TracksChanged(tracks) => {
                if let Some(rotator) = self.rotator.as_mut() {
                    rotator.update_tracks(tracks.clone());
                }
                self.tracks = tracks;
                Ok(())
            }
        }
    }

    async fn process_packet(&mut self, mut packet: MediaPacket) -> Result<(), SessionError> {
        match packet.kind {
            MediaKind::Audio if !self.config.record_audio => return Ok(()),
            MediaKind::Video if self.dropping_until_key => {
                if !packet.is_key {
                    self.stats.dropped += 1;
                    return Ok(());
                }
                self.dropping_until_key = false;
            }
            _ => {}
        }

        let normalizer = self
            .normalizer
            .get_or_insert_with(|| TimestampNormalizer::new(&self.tracks, None));
        if normalizer.normalize(&mut packet).is_rebased() {
            if let Some(hls) = self.hls.as_ref() {
                hls.reset_timestamps().await;
            }
        }

        let started = Instant::now();
        self.write_hls(&packet).await?;
        if let Some(rotator) = self.rotator.as_mut() {
            if let Err(e) = rotator.write_packet(&packet).await {
                warn!(error = %e, "MP4 write failed");
            }
        }
        self.signals.touch();

        if !self.active {
            self.active = true;
            self.deps.states.set_state(self.name(), StreamState::Active);
            info!("Media session streaming");
        }
        self.stats.packets += 1;
        self.publish_stats();

        let took = started.elapsed();
        if took > SLOW_WRITE && !self.dropping_until_key {
            debug!(?took, "Slow write, dropping non-key video until next key frame");
            self.dropping_until_key = true;
        }
        Ok(())
    }

    async fn write_hls(&mut self, packet: &MediaPacket) -> Result<(), SessionError> {
        let Some(hls) = self.hls.as_ref() else {
            return Ok(());
        };
        match hls.write_packet(packet).await {
            Ok(()) => Ok(()),
            Err(e) if e.needs_dts_reset() => {
                warn!(error = %e, "HLS write rejected timestamps, resetting DTS tracker");
                if let Some(normalizer) = self.normalizer.as_mut() {
                    normalizer.reset();
                }
                hls.reset_timestamps().await;
                Ok(())
            }
            Err(e) if e.is_missing_directory() => {
                warn!(error = %e, "HLS output directory vanished, recreating");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the HLS timeline discontinuous and ask for an MP4 cut; both
    /// writers stay open across the reconnect.
    async fn prepare_reconnect(&mut self) {
        if let Some(hls) = self.hls.as_ref() {
            hls.reset_timestamps().await;
        }
        if let Some(rotator) = self.rotator.as_mut() {
            rotator.request_cut();
        }
    }

    async fn shutdown(mut self) {
        self.deps.states.set_state(self.name(), StreamState::Stopping);
        if let Some(hls) = self.hls.take() {
            hls.close().await;
        }
        if let Some(rotator) = self.rotator.take() {
            rotator.close().await;
        }
        self.publish_stats();
        self.deps.states.set_state(self.name(), StreamState::Inactive);
        info!(
            packets = self.stats.packets,
            dropped = self.stats.dropped,
            reconnects = self.stats.reconnects,
            "Media session stopped"
        );
    }
}

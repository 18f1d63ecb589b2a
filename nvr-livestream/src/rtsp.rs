//! RTSP packet source backed by retina.
//!
//! Video is H.264 only; audio is taken when it can be placed in an MP4
//! (AAC with a sample entry) and the stream records audio.

use {
    crate::source::{PacketSource, SourceError, SourceEvent, SourceOpener},
    async_trait::async_trait,
    bytes::Bytes,
    futures::StreamExt,
    nvr_mux::{AudioCodec, AudioTrack, MediaKind, MediaPacket, TrackSet, VideoCodec, VideoTrack},
    retina::{
        client::{Credentials, Demuxed, PlayOptions, Session, SessionGroup, SessionOptions, SetupOptions, Transport},
        codec::{CodecItem, ParametersRef},
    },
    std::{sync::Arc, time::Duration},
    tracing::{debug, info, trace},
    url::Url,
};

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "nvr-livestream";

/// Split `user:pass@` out of an RTSP URL; retina takes credentials separately.
pub fn split_credentials(raw: &str) -> Result<(Url, Option<Credentials>), SourceError> {
    let invalid = |reason: String| SourceError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "rtsp" | "rtsps") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    let creds = if url.username().is_empty() {
        None
    } else {
        let username = percent_decode(url.username());
        let password = url.password().map(percent_decode).unwrap_or_default();
        Some(Credentials { username, password })
    };
    if creds.is_some() {
        url.set_username("")
            .and_then(|()| url.set_password(None))
            .map_err(|()| invalid("cannot strip credentials".to_string()))?;
    }
    Ok((url, creds))
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("v={s}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

/// Opens RTSP sessions that share one teardown group.
pub struct RtspOpener {
    session_group: Arc<SessionGroup>,
    describe_timeout: Duration,
}

impl Default for RtspOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl RtspOpener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_group: Arc::new(SessionGroup::default()),
            describe_timeout: DESCRIBE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_describe_timeout(mut self, timeout: Duration) -> Self {
        self.describe_timeout = timeout;
        self
    }
}

fn video_track(params: &retina::codec::VideoParameters, clock_rate: u32) -> VideoTrack {
    let (width, height) = params.pixel_dimensions();
    VideoTrack {
        codec: VideoCodec::H264,
        width: u16::try_from(width).unwrap_or(u16::MAX),
        height: u16::try_from(height).unwrap_or(u16::MAX),
        clock_rate,
        extra_data: Bytes::copy_from_slice(params.extra_data()),
    }
}

fn audio_track(params: &retina::codec::AudioParameters) -> AudioTrack {
    AudioTrack {
        codec: AudioCodec::Aac,
        clock_rate: params.clock_rate(),
        channels: None,
        extra_data: Bytes::copy_from_slice(params.extra_data()),
        sample_entry: params.sample_entry().map(Bytes::copy_from_slice),
    }
}

#[async_trait]
impl SourceOpener for RtspOpener {
    async fn open(&self, url: &str, record_audio: bool) -> Result<Box<dyn PacketSource>, SourceError> {
        let (url, creds) = split_credentials(url)?;
        let options = SessionOptions::default()
            .creds(creds)
            .session_group(self.session_group.clone())
            .user_agent(USER_AGENT.to_string());

        let mut session = tokio::time::timeout(self.describe_timeout, Session::describe(url.clone(), options))
            .await
            .map_err(|_| SourceError::Timeout(self.describe_timeout))??;

        let video_stream = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && s.encoding_name() == "h264");
        let audio_stream = if record_audio {
            session.streams().iter().position(|s| {
                s.media() == "audio"
                    && matches!(s.parameters(), Some(ParametersRef::Audio(a)) if a.sample_entry().is_some())
            })
        } else {
            None
        };
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(SourceError::NoTracks);
        }

        for i in [video_stream, audio_stream].into_iter().flatten() {
            session
                .setup(i, SetupOptions::default().transport(Transport::default()))
                .await?;
        }

        let mut tracks = TrackSet::default();
        if let Some(i) = video_stream {
            let stream = &session.streams()[i];
            let clock_rate = stream.clock_rate_hz();
            tracks.video = Some(match stream.parameters() {
                Some(ParametersRef::Video(v)) => video_track(v, clock_rate),
                // Parameters arrive in-band with the first key frame.
                _ => VideoTrack {
                    codec: VideoCodec::H264,
                    width: 0,
                    height: 0,
                    clock_rate,
                    extra_data: Bytes::new(),
                },
            });
        }
        if let Some(i) = audio_stream {
            if let Some(ParametersRef::Audio(a)) = session.streams()[i].parameters() {
                tracks.audio = Some(audio_track(a));
            }
        }

        let demuxed = session.play(PlayOptions::default()).await?.demuxed()?;
        info!(
            url = %url,
            video = video_stream.is_some(),
            audio = tracks.audio.is_some(),
            "RTSP session playing"
        );

        Ok(Box::new(RtspSource {
            demuxed,
            tracks,
            video_stream,
            audio_stream,
            pending: None,
        }))
    }
}

pub struct RtspSource {
    demuxed: Demuxed,
    tracks: TrackSet,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    /// A frame held back while its parameter change is reported first.
    pending: Option<MediaPacket>,
}

#[async_trait]
impl PacketSource for RtspSource {
    fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        if let Some(packet) = self.pending.take() {
            return Ok(Some(SourceEvent::Packet(packet)));
        }

        loop {
            let item = match self.demuxed.next().await {
                None => return Ok(None),
                Some(item) => item?,
            };

            match item {
                CodecItem::VideoFrame(frame) if Some(frame.stream_id()) == self.video_stream => {
                    let timestamp = frame.timestamp();
                    let packet = MediaPacket {
                        kind: MediaKind::Video,
                        pts: Some(timestamp.elapsed()),
                        // RTP carries presentation time only.
                        dts: None,
                        time_base: timestamp.clock_rate().get(),
                        is_key: frame.is_random_access_point(),
                        data: Bytes::copy_from_slice(frame.data()),
                    };

                    if frame.has_new_parameters() {
                        if let Some(ParametersRef::Video(v)) =
                            self.demuxed.streams()[frame.stream_id()].parameters()
                        {
                            debug!(width = v.pixel_dimensions().0, height = v.pixel_dimensions().1, "New video parameters");
                            self.tracks.video = Some(video_track(v, packet.time_base));
                            self.pending = Some(packet);
                            return Ok(Some(SourceEvent::TracksChanged(self.tracks.clone())));
                        }
                    }
                    return Ok(Some(SourceEvent::Packet(packet)));
                }
                CodecItem::AudioFrame(frame) if Some(frame.stream_id()) == self.audio_stream => {
                    let timestamp = frame.timestamp();
                    return Ok(Some(SourceEvent::Packet(MediaPacket {
                        kind: MediaKind::Audio,
                        pts: Some(timestamp.elapsed()),
                        dts: None,
                        time_base: timestamp.clock_rate().get(),
                        is_key: true,
                        data: Bytes::copy_from_slice(frame.data()),
                    })));
                }
                other => trace!(?other, "Skipping RTSP item"),
            }
        }
    }
}

use {
    super::errors::Mp4Error,
    crate::{
        h264,
        packet::{rescale, AudioCodec, AudioTrack, MediaKind, MediaPacket, TrackSet, VideoCodec, VideoTrack},
    },
    bytes::{Buf, BufMut, BytesMut},
    std::{io::SeekFrom, time::Duration},
    tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    tracing::warn,
};

const MOVIE_TIMESCALE: u32 = 1000;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
/// Seconds between 1904-01-01 and the Unix epoch.
const MP4_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        let r = {
            $b;
        };
        let len = $buf.len() - pos_start;
        $buf[pos_start..pos_start + 4].copy_from_slice(&u32::try_from(len)?.to_be_bytes()[..]);
        r
    }};
}

async fn write_all_buf<W: AsyncWrite + Unpin, B: Buf>(
    writer: &mut W,
    buf: &mut B,
) -> Result<(), Mp4Error> {
    while buf.has_remaining() {
        writer.write_buf(buf).await?;
    }
    Ok(())
}

/// Tracks the parts of a `trak` atom which are common between video and audio samples.
#[derive(Default)]
struct TrakTracker {
    samples: u32,
    next_pos: Option<u32>,
    chunks: Vec<(u32, u32)>, // (1-based sample_number, byte_pos)
    sizes: Vec<u32>,

    /// Run-length encoded (number of samples, duration). Lags one sample
    /// behind `add_sample` since a duration needs the following timestamp.
    durations: Vec<(u32, u32)>,
    last_ts: Option<i64>,
    tot_duration: u64,
}

impl TrakTracker {
    fn add_sample(&mut self, track: &'static str, pos: u32, size: u32, ts: i64) -> Result<(), Mp4Error> {
        if let Some(last) = self.last_ts {
            if ts < last {
                return Err(Mp4Error::NonMonotonicTimestamp { track, ts, last });
            }
        }
        self.samples += 1;
        if self.next_pos != Some(pos) {
            self.chunks.push((self.samples, pos));
        }
        self.sizes.push(size);
        self.next_pos = Some(pos + size);
        if let Some(last) = self.last_ts.replace(ts) {
            let duration = u32::try_from(ts - last)?;
            self.tot_duration += u64::from(duration);
            match self.durations.last_mut() {
                Some((s, d)) if *d == duration => *s += 1,
                _ => self.durations.push((1, duration)),
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.last_ts.is_some() {
            // the final sample borrows the previous duration
            let last = self.durations.last().map_or(0, |&(_, d)| d);
            self.tot_duration += u64::from(last);
            match self.durations.last_mut() {
                Some((s, d)) if *d == last => *s += 1,
                _ => self.durations.push((1, last)),
            }
        }
    }

    /// Estimates the sum of the variable-sized portions of the data.
    fn size_estimate(&self) -> usize {
        (self.durations.len() * 8) + // stts
        (self.chunks.len() * 12) +   // stsc
        (self.sizes.len() * 4) +     // stsz
        (self.chunks.len() * 4) // stco
    }

    fn write_common_stbl_parts(&self, buf: &mut BytesMut) -> Result<(), Mp4Error> {
        write_box!(buf, b"stts", {
            buf.put_u32(0);
            buf.put_u32(u32::try_from(self.durations.len())?);
            for (samples, duration) in &self.durations {
                buf.put_u32(*samples);
                buf.put_u32(*duration);
            }
        });
        write_box!(buf, b"stsc", {
            buf.put_u32(0); // version
            buf.put_u32(u32::try_from(self.chunks.len())?);
            let mut prev_sample_number = 1;
            let mut chunk_number = 1;
            for &(sample_number, _pos) in self.chunks.iter().skip(1) {
                buf.put_u32(chunk_number);
                buf.put_u32(sample_number - prev_sample_number);
                buf.put_u32(1); // sample_description_index
                prev_sample_number = sample_number;
                chunk_number += 1;
            }
            if !self.chunks.is_empty() {
                buf.put_u32(chunk_number);
                buf.put_u32(self.samples + 1 - prev_sample_number);
                buf.put_u32(1); // sample_description_index
            }
        });
        write_box!(buf, b"stsz", {
            buf.put_u32(0); // version
            buf.put_u32(0); // sample_size
            buf.put_u32(u32::try_from(self.sizes.len())?);
            for s in &self.sizes {
                buf.put_u32(*s);
            }
        });
        write_box!(buf, b"stco", {
            buf.put_u32(0); // version
            buf.put_u32(u32::try_from(self.chunks.len())?); // entry_count
            for &(_sample_number, pos) in &self.chunks {
                buf.put_u32(pos);
            }
        });
        Ok(())
    }
}

/// What a finished file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp4Stats {
    pub video_samples: u32,
    pub audio_samples: u32,
    pub duration: Duration,
    pub bytes: u64,
}

/// Streams samples into `mdat` and writes `moov` at the end.
pub struct Mp4Writer<W: AsyncWrite + AsyncSeek + Send + Unpin> {
    mdat_start: u32,
    mdat_pos: u32,
    creation_time: u64,
    video: Option<VideoTrack>,
    video_length_size: u8,
    audio: Option<AudioTrack>,

    /// The (1-indexed) video sample number of each sync sample.
    video_sync_sample_nums: Vec<u32>,

    /// Run-length encoded (number of samples, pts - dts). Written as `ctts`
    /// only when some sample has a non-zero offset.
    video_composition_offsets: Vec<(u32, u32)>,

    video_trak: TrakTracker,
    audio_trak: TrakTracker,
    inner: W,
}

impl<W: AsyncWrite + AsyncSeek + Send + Unpin> Mp4Writer<W> {
    pub async fn new(tracks: &TrackSet, mut inner: W) -> Result<Self, Mp4Error> {
        let video = tracks.video.clone().filter(|v| {
            let supported = v.codec == VideoCodec::H264;
            if !supported {
                warn!(codec = ?v.codec, "Video codec not supported in MP4, recording without video");
            }
            supported
        });
        let audio = tracks.audio.clone().filter(|a| {
            if a.sample_entry.is_none() {
                warn!(codec = ?a.codec, "No sample entry for audio track, recording without audio");
            }
            a.sample_entry.is_some()
        });
        if video.is_none() && audio.is_none() {
            return Err(Mp4Error::NoTracks);
        }
        let video_length_size = video
            .as_ref()
            .and_then(|v| h264::AvcDecoderConfig::parse(&v.extra_data).ok())
            .map_or(4, |c| c.length_size);

        let mut buf = BytesMut::new();
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(&[
                b'i', b's', b'o', b'm', // major_brand
                0, 0, 0x02, 0, // minor_version
                b'i', b's', b'o', b'm', // compatible_brands[0]
                b'i', b's', b'o', b'2', // compatible_brands[1]
                b'a', b'v', b'c', b'1', // compatible_brands[2]
                b'm', b'p', b'4', b'1', // compatible_brands[3]
            ]);
        });
        buf.extend_from_slice(&b"\0\0\0\0mdat"[..]);
        let mdat_start = u32::try_from(buf.len())?;
        write_all_buf(&mut inner, &mut buf).await?;

        let creation_time = u64::try_from(chrono::Utc::now().timestamp() + MP4_EPOCH_OFFSET)?;

        Ok(Self {
            inner,
            creation_time,
            video,
            video_length_size,
            audio,
            video_trak: TrakTracker::default(),
            audio_trak: TrakTracker::default(),
            video_sync_sample_nums: Vec::new(),
            video_composition_offsets: Vec::new(),
            mdat_start,
            mdat_pos: mdat_start,
        })
    }

    /// The tracks this writer accepted.
    #[must_use]
    pub fn tracks(&self) -> TrackSet {
        TrackSet {
            video: self.video.clone(),
            audio: self.audio.clone(),
        }
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        u64::from(self.mdat_pos)
    }

    #[must_use]
    pub const fn has_samples(&self) -> bool {
        self.video_trak.samples > 0 || self.audio_trak.samples > 0
    }

    /// Append one packet. Packets for tracks this writer does not carry are ignored.
    pub async fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), Mp4Error> {
        match packet.kind {
            MediaKind::Video if self.video.is_some() => self.video(packet).await,
            MediaKind::Audio if self.audio.is_some() => self.audio(packet).await,
            _ => Ok(()),
        }
    }

    async fn video(&mut self, packet: &MediaPacket) -> Result<(), Mp4Error> {
        let ts = packet.decode_ts().ok_or(Mp4Error::MissingTimestamp)?;
        let offset = u32::try_from(packet.pts.map_or(0, |pts| pts - ts).max(0))?;
        let mut data = if h264::is_annex_b(&packet.data) {
            h264::annex_b_to_avcc(&packet.data).freeze()
        } else if self.video_length_size != 4 {
            let mut out = BytesMut::with_capacity(packet.data.len() + 16);
            for nal in h264::split_avcc(&packet.data, self.video_length_size)? {
                out.put_u32(u32::try_from(nal.len())?);
                out.put_slice(nal);
            }
            out.freeze()
        } else {
            packet.data.clone()
        };

        let size = u32::try_from(data.remaining())?;
        let next = self.mdat_pos.checked_add(size).ok_or(Mp4Error::FileTooLarge)?;
        self.video_trak.add_sample("video", self.mdat_pos, size, ts)?;
        self.mdat_pos = next;
        if packet.is_key {
            self.video_sync_sample_nums.push(self.video_trak.samples);
        }
        match self.video_composition_offsets.last_mut() {
            Some((n, o)) if *o == offset => *n += 1,
            _ => self.video_composition_offsets.push((1, offset)),
        }
        write_all_buf(&mut self.inner, &mut data).await?;
        Ok(())
    }

    async fn audio(&mut self, packet: &MediaPacket) -> Result<(), Mp4Error> {
        let ts = packet.decode_ts().ok_or(Mp4Error::MissingTimestamp)?;
        let mut data = packet.data.clone();
        let size = u32::try_from(data.remaining())?;
        let next = self.mdat_pos.checked_add(size).ok_or(Mp4Error::FileTooLarge)?;
        self.audio_trak.add_sample("audio", self.mdat_pos, size, ts)?;
        self.mdat_pos = next;
        write_all_buf(&mut self.inner, &mut data).await?;
        Ok(())
    }

    fn movie_duration(&self) -> u64 {
        let video = self.video.as_ref().map_or(0, |v| {
            to_movie_timescale(self.video_trak.tot_duration, v.clock_rate)
        });
        let audio = self.audio.as_ref().map_or(0, |a| {
            to_movie_timescale(self.audio_trak.tot_duration, a.clock_rate)
        });
        video.max(audio)
    }

    /// Write `moov`, patch the `mdat` size and hand back the sink.
    pub async fn finish(mut self) -> Result<(Mp4Stats, W), Mp4Error> {
        self.video_trak.finish();
        self.audio_trak.finish();
        let mut buf = BytesMut::with_capacity(
            1024 + self.video_trak.size_estimate()
                + self.audio_trak.size_estimate()
                + 4 * self.video_sync_sample_nums.len()
                + 8 * self.video_composition_offsets.len(),
        );
        let movie_duration = self.movie_duration();
        write_box!(&mut buf, b"moov", {
            write_box!(&mut buf, b"mvhd", {
                buf.put_u32(1 << 24); // version
                buf.put_u64(self.creation_time);
                buf.put_u64(self.creation_time);
                buf.put_u32(MOVIE_TIMESCALE);
                buf.put_u64(movie_duration);
                buf.put_u32(0x00010000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &UNITY_MATRIX {
                    buf.put_u32(*v);
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(3); // next_track_id
            });
            if let Some(v) = self.video.as_ref() {
                self.write_video_trak(&mut buf, v)?;
            }
            if let Some(a) = self.audio.as_ref() {
                self.write_audio_trak(&mut buf, a)?;
            }
        });
        write_all_buf(&mut self.inner, &mut buf.freeze()).await?;
        self.inner
            .seek(SeekFrom::Start(u64::from(self.mdat_start - 8)))
            .await?;
        self.inner
            .write_all(&(self.mdat_pos + 8 - self.mdat_start).to_be_bytes()[..])
            .await?;
        self.inner.seek(SeekFrom::End(0)).await?;
        self.inner.flush().await?;

        let stats = Mp4Stats {
            video_samples: self.video_trak.samples,
            audio_samples: self.audio_trak.samples,
            duration: Duration::from_millis(movie_duration),
            bytes: u64::from(self.mdat_pos),
        };
        Ok((stats, self.inner))
    }

    fn write_tkhd(&self, buf: &mut BytesMut, track_id: u32, duration: u64, audio: bool, dims: (u16, u16)) -> Result<(), Mp4Error> {
        write_box!(buf, b"tkhd", {
            buf.put_u32((1 << 24) | 7); // version, flags
            buf.put_u64(self.creation_time);
            buf.put_u64(self.creation_time);
            buf.put_u32(track_id);
            buf.put_u32(0); // reserved
            buf.put_u64(duration);
            buf.put_u64(0); // reserved
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate_group
            buf.put_u16(if audio { 0x0100 } else { 0 }); // volume
            buf.put_u16(0); // reserved
            for v in &UNITY_MATRIX {
                buf.put_u32(*v);
            }
            buf.put_u32(u32::from(dims.0) << 16);
            buf.put_u32(u32::from(dims.1) << 16);
        });
        Ok(())
    }

    fn write_mdhd(&self, buf: &mut BytesMut, timescale: u32, duration: u64) -> Result<(), Mp4Error> {
        write_box!(buf, b"mdhd", {
            buf.put_u32(1 << 24); // version
            buf.put_u64(self.creation_time);
            buf.put_u64(self.creation_time);
            buf.put_u32(timescale);
            buf.put_u64(duration);
            buf.put_u32(0x55c40000); // language=und + pre-defined
        });
        Ok(())
    }

    fn write_video_trak(&self, buf: &mut BytesMut, track: &VideoTrack) -> Result<(), Mp4Error> {
        write_box!(buf, b"trak", {
            let duration = to_movie_timescale(self.video_trak.tot_duration, track.clock_rate);
            self.write_tkhd(buf, 1, duration, false, (track.width, track.height))?;
            write_box!(buf, b"mdia", {
                self.write_mdhd(buf, track.clock_rate, self.video_trak.tot_duration)?;
                write_hdlr(buf, b"vide")?;
                write_box!(buf, b"minf", {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1);
                        buf.put_u64(0);
                    });
                    write_dinf(buf)?;
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            write_avc1_sample_entry(buf, track)?;
                        });
                        self.video_trak.write_common_stbl_parts(buf)?;
                        write_box!(buf, b"stss", {
                            buf.put_u32(0); // version
                            buf.put_u32(u32::try_from(self.video_sync_sample_nums.len())?);
                            for n in &self.video_sync_sample_nums {
                                buf.put_u32(*n);
                            }
                        });
                        if self.video_composition_offsets.iter().any(|&(_, o)| o != 0) {
                            write_box!(buf, b"ctts", {
                                buf.put_u32(0); // version
                                buf.put_u32(u32::try_from(self.video_composition_offsets.len())?);
                                for (samples, offset) in &self.video_composition_offsets {
                                    buf.put_u32(*samples);
                                    buf.put_u32(*offset);
                                }
                            });
                        }
                    });
                });
            });
        });
        Ok(())
    }

    fn write_audio_trak(&self, buf: &mut BytesMut, track: &AudioTrack) -> Result<(), Mp4Error> {
        write_box!(buf, b"trak", {
            let duration = to_movie_timescale(self.audio_trak.tot_duration, track.clock_rate);
            self.write_tkhd(buf, 2, duration, true, (0, 0))?;
            write_box!(buf, b"mdia", {
                self.write_mdhd(buf, track.clock_rate, self.audio_trak.tot_duration)?;
                write_hdlr(buf, b"soun")?;
                write_box!(buf, b"minf", {
                    write_box!(buf, b"smhd", {
                        buf.extend_from_slice(&[
                            0x00, 0x00, 0x00, 0x00, // version + flags
                            0x00, 0x00, // balance
                            0x00, 0x00, // reserved
                        ]);
                    });
                    write_dinf(buf)?;
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            if let Some(entry) = track.sample_entry.as_ref() {
                                buf.extend_from_slice(entry);
                            }
                        });
                        self.audio_trak.write_common_stbl_parts(buf)?;

                        // AAC needs the previous frame to decode accurately.
                        if track.codec == AudioCodec::Aac {
                            write_box!(buf, b"sgpd", {
                                buf.put_u32(0); // version
                                buf.extend_from_slice(b"roll"); // grouping type
                                buf.put_u32(1); // entry_count
                                buf.put_i16(-1); // roll_distance
                            });
                            write_box!(buf, b"sbgp", {
                                buf.put_u32(0); // version
                                buf.extend_from_slice(b"roll"); // grouping type
                                buf.put_u32(1); // entry_count
                                buf.put_u32(self.audio_trak.samples);
                                buf.put_u32(1); // group_description_index
                            });
                        }
                    });
                });
            });
        });
        Ok(())
    }
}

fn to_movie_timescale(duration: u64, clock_rate: u32) -> u64 {
    u64::try_from(rescale(
        i64::try_from(duration).unwrap_or(i64::MAX),
        clock_rate,
        MOVIE_TIMESCALE,
    ))
    .unwrap_or(0)
}

fn write_hdlr(buf: &mut BytesMut, handler: &[u8; 4]) -> Result<(), Mp4Error> {
    write_box!(buf, b"hdlr", {
        buf.put_u32(0); // version + flags
        buf.put_u32(0); // pre_defined
        buf.extend_from_slice(handler);
        buf.put_u32(0); // reserved[0]
        buf.put_u32(0); // reserved[1]
        buf.put_u32(0); // reserved[2]
        buf.put_u8(0); // name, zero-terminated (empty)
    });
    Ok(())
}

fn write_dinf(buf: &mut BytesMut) -> Result<(), Mp4Error> {
    write_box!(buf, b"dinf", {
        write_box!(buf, b"dref", {
            buf.put_u32(0);
            buf.put_u32(1); // entry_count
            write_box!(buf, b"url ", {
                buf.put_u32(1); // version, flags=self-contained
            });
        });
    });
    Ok(())
}

fn write_avc1_sample_entry(buf: &mut BytesMut, track: &VideoTrack) -> Result<(), Mp4Error> {
    write_box!(buf, b"avc1", {
        buf.put_u32(0);
        buf.put_u32(1); // data_reference_index = 1
        buf.extend_from_slice(&[0; 16]);
        buf.put_u16(track.width);
        buf.put_u16(track.height);
        buf.extend_from_slice(&[
            0x00, 0x48, 0x00, 0x00, // horizresolution
            0x00, 0x48, 0x00, 0x00, // vertresolution
            0x00, 0x00, 0x00, 0x00, // reserved
            0x00, 0x01, // frame count
        ]);
        buf.extend_from_slice(&[0; 32]); // compressorname
        buf.extend_from_slice(&[0x00, 0x18, 0xff, 0xff]); // depth + pre_defined
        write_box!(buf, b"avcC", {
            buf.extend_from_slice(&track.extra_data);
        });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Cursor;

    fn video_track() -> VideoTrack {
        let config = h264::AvcDecoderConfig::from_parameter_sets(
            &[0x67, 0x64, 0x00, 0x1F, 0xAC],
            &[0x68, 0xEB, 0xE3],
        )
        .unwrap();
        VideoTrack {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            clock_rate: 90_000,
            extra_data: config.to_record(),
        }
    }

    fn find_box(data: &[u8], fourcc: &[u8; 4]) -> Option<usize> {
        data.windows(4).position(|w| w == fourcc).map(|p| p - 4)
    }

    #[tokio::test]
    async fn test_writes_ftyp_mdat_moov() {
        let tracks = TrackSet {
            video: Some(video_track()),
            audio: None,
        };
        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        for i in 0..30i64 {
            let packet = MediaPacket::video(i * 3000, 90_000, i % 10 == 0, vec![0, 0, 0, 2, 0x65, i as u8]);
            writer.write_packet(&packet).await.unwrap();
        }
        let (stats, cursor) = writer.finish().await.unwrap();
        assert_eq!(stats.video_samples, 30);
        assert_eq!(stats.duration, Duration::from_secs(1));

        let data = cursor.into_inner();
        assert_eq!(&data[4..8], b"ftyp");
        let mdat = find_box(&data, b"mdat").unwrap();
        let mdat_len = u32::from_be_bytes(data[mdat..mdat + 4].try_into().unwrap()) as usize;
        assert_eq!(mdat_len, 8 + 30 * 6);
        let moov = mdat + mdat_len;
        assert_eq!(&data[moov + 4..moov + 8], b"moov");
        let moov_len = u32::from_be_bytes(data[moov..moov + 4].try_into().unwrap()) as usize;
        assert_eq!(moov + moov_len, data.len());

        let stss = find_box(&data, b"stss").unwrap();
        let count = u32::from_be_bytes(data[stss + 12..stss + 16].try_into().unwrap());
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_composition_offsets_written_as_ctts() {
        let tracks = TrackSet {
            video: Some(video_track()),
            audio: None,
        };

        // pts == dts needs no ctts
        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        for i in 0..4i64 {
            let packet = MediaPacket::video(i * 3000, 90_000, i == 0, vec![0, 0, 0, 1, 0x65]);
            writer.write_packet(&packet).await.unwrap();
        }
        let (_, cursor) = writer.finish().await.unwrap();
        assert!(find_box(&cursor.into_inner(), b"ctts").is_none());

        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        for i in 0..4i64 {
            let mut packet = MediaPacket::video(i * 3000 + 6000, 90_000, i == 0, vec![0, 0, 0, 1, 0x65]);
            packet.dts = Some(i * 3000);
            writer.write_packet(&packet).await.unwrap();
        }
        let mut packet = MediaPacket::video(12_000, 90_000, false, vec![0, 0, 0, 1, 0x41]);
        packet.dts = Some(12_000);
        writer.write_packet(&packet).await.unwrap();
        let (_, cursor) = writer.finish().await.unwrap();
        let data = cursor.into_inner();

        let ctts = find_box(&data, b"ctts").unwrap();
        let field = |at: usize| u32::from_be_bytes(data[ctts + at..ctts + at + 4].try_into().unwrap());
        assert_eq!(field(0), 8 + 4 + 4 + 2 * 8);
        assert_eq!(field(12), 2);
        assert_eq!((field(16), field(20)), (4, 6000));
        assert_eq!((field(24), field(28)), (1, 0));
    }

    #[tokio::test]
    async fn test_rejects_backwards_timestamps() {
        let tracks = TrackSet {
            video: Some(video_track()),
            audio: None,
        };
        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        writer
            .write_packet(&MediaPacket::video(9000, 90_000, true, vec![0, 0, 0, 1, 0x65]))
            .await
            .unwrap();
        let err = writer
            .write_packet(&MediaPacket::video(0, 90_000, false, vec![0, 0, 0, 1, 0x41]))
            .await
            .unwrap_err();
        assert!(matches!(err, Mp4Error::NonMonotonicTimestamp { .. }));
    }

    #[tokio::test]
    async fn test_annex_b_input_is_length_prefixed() {
        let tracks = TrackSet {
            video: Some(video_track()),
            audio: None,
        };
        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        writer
            .write_packet(&MediaPacket::video(0, 90_000, true, vec![0, 0, 0, 1, 0x65, 0xAA]))
            .await
            .unwrap();
        let (_, cursor) = writer.finish().await.unwrap();
        let data = cursor.into_inner();
        let mdat = find_box(&data, b"mdat").unwrap();
        assert_eq!(&data[mdat + 8..mdat + 14], &[0, 0, 0, 2, 0x65, 0xAA]);
    }

    #[tokio::test]
    async fn test_audio_without_sample_entry_is_dropped() {
        let tracks = TrackSet {
            video: None,
            audio: Some(AudioTrack {
                codec: AudioCodec::Other("pcma".to_string()),
                clock_rate: 8000,
                channels: Some(1),
                extra_data: Bytes::new(),
                sample_entry: None,
            }),
        };
        let result = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await;
        assert!(matches!(result, Err(Mp4Error::NoTracks)));
    }

    #[tokio::test]
    async fn test_audio_only_file() {
        let tracks = TrackSet {
            video: None,
            audio: Some(AudioTrack {
                codec: AudioCodec::Aac,
                clock_rate: 48_000,
                channels: Some(2),
                extra_data: Bytes::from_static(&[0x11, 0x90]),
                sample_entry: Some(Bytes::from_static(&[0, 0, 0, 8, b'm', b'p', b'4', b'a'])),
            }),
        };
        let mut writer = Mp4Writer::new(&tracks, Cursor::new(Vec::new())).await.unwrap();
        for i in 0..47i64 {
            writer
                .write_packet(&MediaPacket::audio(i * 1024, 48_000, vec![0x21; 10]))
                .await
                .unwrap();
        }
        // video packets are ignored when no video track is carried
        writer
            .write_packet(&MediaPacket::video(0, 90_000, true, vec![1]))
            .await
            .unwrap();
        let (stats, cursor) = writer.finish().await.unwrap();
        assert_eq!(stats.audio_samples, 47);
        assert_eq!(stats.video_samples, 0);
        assert_eq!(stats.duration, Duration::from_millis(1003));
        assert!(find_box(&cursor.into_inner(), b"sgpd").is_some());
    }
}

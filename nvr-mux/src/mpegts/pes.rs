use {
    super::{define::epes_stream_id, errors::MpegTsError},
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    bytes::BytesMut,
};

const TIMESTAMP_MASK: i64 = (1 << 33) - 1;

/// One elementary stream inside the program.
#[derive(Debug, Clone)]
pub struct Pes {
    pub pid: u16,
    pub codec_id: u8,
    pub stream_id: u8,
    pub continuity_counter: u8,
    pub last_dts: Option<i64>,
}

impl Pes {
    #[must_use]
    pub const fn new(pid: u16, codec_id: u8, is_video: bool) -> Self {
        Self {
            pid,
            codec_id,
            stream_id: if is_video {
                epes_stream_id::PES_SID_VIDEO
            } else {
                epes_stream_id::PES_SID_AUDIO
            },
            continuity_counter: 0,
            last_dts: None,
        }
    }

    #[must_use]
    pub const fn is_video(&self) -> bool {
        self.stream_id == epes_stream_id::PES_SID_VIDEO
    }

    /// Current counter value, then advance it modulo 16.
    pub fn next_continuity_counter(&mut self) -> u8 {
        let cc = self.continuity_counter;
        self.continuity_counter = (cc + 1) & 0x0F;
        cc
    }
}

#[derive(Default)]
pub struct PesMuxer {
    pub bytes_writer: BytesWriter,
}

//ITU-T H.222.0 2.4.3.6
impl PesMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_writer: BytesWriter::new(),
        }
    }

    /// Build a complete PES packet (header followed by `payload`).
    /// Timestamps are in 90 kHz units; DTS is only written when it differs from PTS.
    pub fn write(
        &mut self,
        stream_id: u8,
        pts: i64,
        dts: i64,
        payload: &[u8],
    ) -> Result<BytesMut, MpegTsError> {
        let with_dts = pts != dts;
        let header_data_length: u8 = if with_dts { 10 } else { 5 };

        /*packet_start_code_prefix*/
        self.bytes_writer.write(&[0x00, 0x00, 0x01])?;
        /*stream_id*/
        self.bytes_writer.write_u8(stream_id)?;

        /*PES_packet_length, 0 (unbounded) when it does not fit*/
        let packet_length = 3 + usize::from(header_data_length) + payload.len();
        let packet_length = if packet_length > 0xFFFF {
            0
        } else {
            packet_length as u16
        };
        self.bytes_writer.write_u16::<BigEndian>(packet_length)?;

        /*'10' marker, no scrambling, no priority*/
        self.bytes_writer.write_u8(0x80)?;
        /*PTS_DTS_flags*/
        self.bytes_writer.write_u8(if with_dts { 0xC0 } else { 0x80 })?;
        /*PES_header_data_length*/
        self.bytes_writer.write_u8(header_data_length)?;

        if with_dts {
            self.write_timestamp(0x03, pts)?;
            self.write_timestamp(0x01, dts)?;
        } else {
            self.write_timestamp(0x02, pts)?;
        }

        self.bytes_writer.write(payload)?;
        Ok(self.bytes_writer.extract_current_bytes())
    }

    fn write_timestamp(&mut self, prefix: u8, ts: i64) -> Result<(), MpegTsError> {
        let ts = (ts & TIMESTAMP_MASK) as u64;
        self.bytes_writer
            .write_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 0x01)?;
        self.bytes_writer.write_u8(((ts >> 22) & 0xFF) as u8)?;
        self.bytes_writer
            .write_u8(((((ts >> 15) & 0x7F) as u8) << 1) | 0x01)?;
        self.bytes_writer.write_u8(((ts >> 7) & 0xFF) as u8)?;
        self.bytes_writer.write_u8((((ts & 0x7F) as u8) << 1) | 0x01)?;
        Ok(())
    }
}

/// Decode a 5-byte PES timestamp field.
#[must_use]
pub fn read_timestamp(b: &[u8; 5]) -> i64 {
    ((i64::from(b[0]) >> 1) & 0x07) << 30
        | i64::from(b[1]) << 22
        | (i64::from(b[2]) >> 1) << 15
        | i64::from(b[3]) << 7
        | i64::from(b[4]) >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_only_header() {
        let mut muxer = PesMuxer::new();
        let pes = muxer
            .write(epes_stream_id::PES_SID_AUDIO, 90_000, 90_000, &[0xAA; 4])
            .unwrap();
        assert_eq!(&pes[..4], &[0, 0, 1, 0xC0]);
        assert_eq!(u16::from_be_bytes([pes[4], pes[5]]), 3 + 5 + 4);
        assert_eq!(pes[7], 0x80);
        assert_eq!(pes[8], 5);
        assert_eq!(pes[9] >> 4, 0x02);
        let ts: [u8; 5] = pes[9..14].try_into().unwrap();
        assert_eq!(read_timestamp(&ts), 90_000);
        assert_eq!(&pes[14..], &[0xAA; 4]);
    }

    #[test]
    fn test_pts_and_dts_header() {
        let mut muxer = PesMuxer::new();
        let pes = muxer
            .write(epes_stream_id::PES_SID_VIDEO, 6006, 3003, &[1, 2])
            .unwrap();
        assert_eq!(pes[7], 0xC0);
        assert_eq!(pes[8], 10);
        let pts: [u8; 5] = pes[9..14].try_into().unwrap();
        let dts: [u8; 5] = pes[14..19].try_into().unwrap();
        assert_eq!(pts[0] >> 4, 0x03);
        assert_eq!(dts[0] >> 4, 0x01);
        assert_eq!(read_timestamp(&pts), 6006);
        assert_eq!(read_timestamp(&dts), 3003);
    }

    #[test]
    fn test_large_video_payload_is_unbounded() {
        let mut muxer = PesMuxer::new();
        let payload = vec![0u8; 70_000];
        let pes = muxer
            .write(epes_stream_id::PES_SID_VIDEO, 0, 0, &payload)
            .unwrap();
        assert_eq!(u16::from_be_bytes([pes[4], pes[5]]), 0);
    }

    #[test]
    fn test_timestamp_wraps_at_33_bits() {
        let mut muxer = PesMuxer::new();
        let pes = muxer
            .write(epes_stream_id::PES_SID_AUDIO, (1 << 33) + 5, (1 << 33) + 5, &[])
            .unwrap();
        let ts: [u8; 5] = pes[9..14].try_into().unwrap();
        assert_eq!(read_timestamp(&ts), 5);
    }

    #[test]
    fn test_continuity_counter_wraps() {
        let mut pes = Pes::new(0x100, 0x1B, true);
        for expected in 0..16 {
            assert_eq!(pes.next_continuity_counter(), expected);
        }
        assert_eq!(pes.next_continuity_counter(), 0);
        assert!(pes.is_video());
    }
}

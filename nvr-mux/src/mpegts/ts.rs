use {
    super::{
        define::{
            epsi_stream_type, ts_pid, MPEG_FLAG_IDR_FRAME, PAT_PERIOD, TS_PACKET_SIZE,
            TS_PAYLOAD_SIZE, TS_SYNC_BYTE,
        },
        errors::MpegTsError,
        pes::{Pes, PesMuxer},
        psi::Program,
    },
    crate::bytesio::bytes_writer::BytesWriter,
    bytes::BytesMut,
};

const MAX_STREAMS: usize = 4;
const PCR_FLAG: u8 = 0x10;
const RANDOM_ACCESS_FLAG: u8 = 0x40;

/// Single-program MPEG-TS muxer.
///
/// Packets accumulate in an internal buffer until [`TsMuxer::get_data`] takes
/// them. After [`TsMuxer::reset`] the next write starts with PAT/PMT so every
/// chunk handed out is independently decodable.
pub struct TsMuxer {
    pes_muxer: PesMuxer,
    program: Program,
    pat_continuity_counter: u8,
    pmt_continuity_counter: u8,
    bytes_writer: BytesWriter,
    psi_pending: bool,
    last_psi_dts: Option<i64>,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pes_muxer: PesMuxer::new(),
            program: Program::new(1, ts_pid::PID_PMT),
            pat_continuity_counter: 0,
            pmt_continuity_counter: 0,
            bytes_writer: BytesWriter::new(),
            psi_pending: true,
            last_psi_dts: None,
        }
    }

    /// Register an elementary stream and return its PID.
    pub fn add_stream(&mut self, codec_id: u8) -> Result<u16, MpegTsError> {
        let is_video = matches!(
            codec_id,
            epsi_stream_type::PSI_STREAM_H264 | epsi_stream_type::PSI_STREAM_H265
        );
        let program = &mut self.program;
        if program.streams.len() >= MAX_STREAMS {
            return Err(MpegTsError::TooManyStreams(MAX_STREAMS));
        }

        let pid = ts_pid::PID_FIRST_ES + program.streams.len() as u16;
        program.streams.push(Pes::new(pid, codec_id, is_video));

        // PCR rides on the first video stream, or the first stream when audio-only.
        program.pcr_pid = program
            .streams
            .iter()
            .find(|s| s.is_video())
            .or_else(|| program.streams.first())
            .map_or(pid, |s| s.pid);
        program.version = (program.version + 1) & 0x1F;
        self.psi_pending = true;

        Ok(pid)
    }

    /// Mux one access unit. `pts`/`dts` are 90 kHz ticks.
    pub fn write(
        &mut self,
        pid: u16,
        pts: i64,
        dts: i64,
        flags: u16,
        payload: &[u8],
    ) -> Result<(), MpegTsError> {
        let program = &self.program;
        let index = program
            .find_stream(pid)
            .ok_or(MpegTsError::UnknownPid(pid))?;
        let pcr_pid = program.pcr_pid;
        let stream = &program.streams[index];

        if let Some(last) = stream.last_dts {
            if dts < last {
                return Err(MpegTsError::NonMonotonicDts { pid, dts, last });
            }
        }

        let key = flags & MPEG_FLAG_IDR_FRAME != 0;
        let periodic = self
            .last_psi_dts
            .map_or(true, |last| dts - last >= PAT_PERIOD);
        if self.psi_pending || periodic || (key && pid == pcr_pid) {
            self.write_psi()?;
            self.last_psi_dts = Some(dts);
        }

        let stream_id = self.program.streams[index].stream_id;
        let pes = self.pes_muxer.write(stream_id, pts, dts, payload)?;
        let pcr = (pid == pcr_pid).then_some(dts);
        self.write_pes_packets(index, &pes, key, pcr)?;

        self.program.streams[index].last_dts = Some(dts);
        Ok(())
    }

    /// Take all bytes muxed since the last call.
    pub fn get_data(&mut self) -> BytesMut {
        self.bytes_writer.extract_current_bytes()
    }

    /// Drop buffered output and force PAT/PMT ahead of the next packet.
    pub fn reset(&mut self) {
        self.bytes_writer.clear();
        self.psi_pending = true;
        self.last_psi_dts = None;
    }

    /// Forget per-stream DTS history, e.g. after the upstream clock was reset.
    pub fn reset_timestamps(&mut self) {
        for stream in &mut self.program.streams {
            stream.last_dts = None;
        }
        self.last_psi_dts = None;
    }

    fn write_psi(&mut self) -> Result<(), MpegTsError> {
        let pat = self.program.pat_section()?;
        let cc = self.pat_continuity_counter;
        self.pat_continuity_counter = (cc + 1) & 0x0F;
        self.write_section_packet(ts_pid::PID_PAT, cc, &pat)?;

        let pmt = self.program.pmt_section()?;
        let cc = self.pmt_continuity_counter;
        self.pmt_continuity_counter = (cc + 1) & 0x0F;
        self.write_section_packet(self.program.pmt_pid, cc, &pmt)?;

        self.psi_pending = false;
        Ok(())
    }

    fn write_section_packet(&mut self, pid: u16, cc: u8, section: &[u8]) -> Result<(), MpegTsError> {
        let start = self.bytes_writer.len();
        self.bytes_writer.write_u8(TS_SYNC_BYTE)?;
        /*payload_unit_start_indicator*/
        self.bytes_writer.write_u8(0x40 | ((pid >> 8) as u8 & 0x1F))?;
        self.bytes_writer.write_u8((pid & 0xFF) as u8)?;
        /*payload only*/
        self.bytes_writer.write_u8(0x10 | (cc & 0x0F))?;
        /*pointer_field*/
        self.bytes_writer.write_u8(0x00)?;

        let room = TS_PACKET_SIZE - (self.bytes_writer.len() - start);
        let take = section.len().min(room);
        self.bytes_writer.write(&section[..take])?;
        self.bytes_writer.write_repeat(0xFF, room - take)?;
        Ok(())
    }

    fn write_pes_packets(
        &mut self,
        index: usize,
        pes: &[u8],
        key: bool,
        pcr: Option<i64>,
    ) -> Result<(), MpegTsError> {
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let remaining = pes.len() - offset;

            // adaptation field body, excluding its length byte
            let mut adaptation = Vec::new();
            if first && (key || pcr.is_some()) {
                let mut field_flags = 0u8;
                if key {
                    field_flags |= RANDOM_ACCESS_FLAG;
                }
                if pcr.is_some() {
                    field_flags |= PCR_FLAG;
                }
                adaptation.push(field_flags);
                if let Some(pcr) = pcr {
                    adaptation.extend_from_slice(&encode_pcr(pcr));
                }
            }

            let mut has_adaptation = !adaptation.is_empty();
            let adaptation_len = if has_adaptation { adaptation.len() + 1 } else { 0 };
            let payload_len = remaining.min(TS_PAYLOAD_SIZE - adaptation_len);
            let stuffing = TS_PAYLOAD_SIZE - adaptation_len - payload_len;

            if stuffing > 0 {
                if has_adaptation {
                    adaptation.resize(adaptation.len() + stuffing, 0xFF);
                } else {
                    has_adaptation = true;
                    // a single stuffing byte is just a zero-length adaptation field
                    if stuffing > 1 {
                        adaptation.push(0x00);
                        adaptation.resize(stuffing - 1, 0xFF);
                    }
                }
            }

            let stream = &mut self.program.streams[index];
            let pid = stream.pid;
            let cc = stream.next_continuity_counter();

            self.bytes_writer.write_u8(TS_SYNC_BYTE)?;
            let pusi = if first { 0x40 } else { 0x00 };
            self.bytes_writer
                .write_u8(pusi | ((pid >> 8) as u8 & 0x1F))?;
            self.bytes_writer.write_u8((pid & 0xFF) as u8)?;
            let adaptation_control = if has_adaptation { 0x30 } else { 0x10 };
            self.bytes_writer.write_u8(adaptation_control | cc)?;

            if has_adaptation {
                self.bytes_writer.write_u8(adaptation.len() as u8)?;
                self.bytes_writer.write(&adaptation)?;
            }
            self.bytes_writer.write(&pes[offset..offset + payload_len])?;

            offset += payload_len;
            first = false;
        }

        Ok(())
    }
}

/// PCR from a 90 kHz clock: 33-bit base, 6 reserved bits, 9-bit extension (zero).
fn encode_pcr(dts: i64) -> [u8; 6] {
    let base = (dts & ((1 << 33) - 1)) as u64;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 0x01) as u8) << 7) | 0x7E,
        0x00,
    ]
}

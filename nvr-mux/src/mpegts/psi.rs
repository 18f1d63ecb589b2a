//! Program-specific information for a single-program transport stream.

use {
    super::{
        crc32,
        define::{epat_pid, epsi_stream_type},
        errors::MpegTsError,
        pes::Pes,
    },
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    bytes::BytesMut,
};

const TRANSPORT_STREAM_ID: u16 = 1;
/// Reserved bits set, 13-bit PID follows.
const PID_PREFIX: u16 = 0xE000;

/// The one program carried by a segment.
#[derive(Debug, Clone)]
pub struct Program {
    pub number: u16,
    pub pmt_pid: u16,
    /// Bumped (mod 32) whenever the stream list changes.
    pub version: u8,
    pub pcr_pid: u16,
    pub streams: Vec<Pes>,
}

impl Program {
    #[must_use]
    pub const fn new(number: u16, pmt_pid: u16) -> Self {
        Self {
            number,
            pmt_pid,
            version: 0,
            pcr_pid: 0,
            streams: Vec::new(),
        }
    }

    #[must_use]
    pub fn find_stream(&self, pid: u16) -> Option<usize> {
        self.streams.iter().position(|s| s.pid == pid)
    }

    /// Program association section (ITU-T H.222.0 2.4.4.3).
    pub fn pat_section(&self) -> Result<BytesMut, MpegTsError> {
        let mut body = BytesWriter::new();
        body.write_u16::<BigEndian>(TRANSPORT_STREAM_ID)?;
        // version 0, current_next_indicator
        body.write_u8(0xC1)?;
        // section_number, last_section_number
        body.write_u16::<BigEndian>(0)?;
        body.write_u16::<BigEndian>(self.number)?;
        body.write_u16::<BigEndian>(PID_PREFIX | self.pmt_pid)?;
        section(epat_pid::PAT_TID_PAS as u8, body.get_current_bytes())
    }

    /// Program map section (ITU-T H.222.0 2.4.4.8), no descriptors.
    pub fn pmt_section(&self) -> Result<BytesMut, MpegTsError> {
        let mut body = BytesWriter::new();
        body.write_u16::<BigEndian>(self.number)?;
        body.write_u8(0xC1 | ((self.version & 0x1F) << 1))?;
        body.write_u16::<BigEndian>(0)?;
        body.write_u16::<BigEndian>(PID_PREFIX | self.pcr_pid)?;
        // program_info_length
        body.write_u16::<BigEndian>(0xF000)?;

        for stream in &self.streams {
            let stream_type = match stream.codec_id {
                epsi_stream_type::PSI_STREAM_AUDIO_OPUS => epsi_stream_type::PSI_STREAM_PRIVATE_DATA,
                other => other,
            };
            body.write_u8(stream_type)?;
            body.write_u16::<BigEndian>(PID_PREFIX | stream.pid)?;
            // ES_info_length
            body.write_u16::<BigEndian>(0xF000)?;
        }
        section(epat_pid::PAT_TID_PMS as u8, body.get_current_bytes())
    }
}

/// Table id, section length (body + CRC), body, CRC-32.
fn section(table_id: u8, body: &[u8]) -> Result<BytesMut, MpegTsError> {
    let mut writer = BytesWriter::new();
    writer.write_u8(table_id)?;
    writer.write_u16::<BigEndian>(0xB000 | (body.len() as u16 + 4))?;
    writer.write(body)?;
    let crc = crc32::gen_crc32(0xffff_ffff, writer.get_current_bytes());
    writer.write_u32::<BigEndian>(crc)?;
    Ok(writer.extract_current_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_length(data: &[u8]) -> usize {
        usize::from(u16::from_be_bytes([data[1], data[2]]) & 0x0FFF)
    }

    #[test]
    fn test_pat_points_at_pmt() {
        let program = Program::new(1, 0x1000);
        let data = program.pat_section().unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], epat_pid::PAT_TID_PAS as u8);
        assert_eq!(section_length(&data) + 3, data.len());
        assert_eq!(u16::from_be_bytes([data[8], data[9]]), 1);
        assert_eq!(u16::from_be_bytes([data[10], data[11]]) & 0x1FFF, 0x1000);
        // a section followed by its CRC has a zero residue
        assert_eq!(crc32::gen_crc32(0xffff_ffff, &data), 0);
    }

    #[test]
    fn test_pmt_lists_streams() {
        let mut program = Program::new(1, 0x1000);
        assert_eq!(program.pmt_section().unwrap().len(), 16);

        program.pcr_pid = 0x100;
        program.version = 3;
        program
            .streams
            .push(Pes::new(0x100, epsi_stream_type::PSI_STREAM_H264, true));
        program
            .streams
            .push(Pes::new(0x101, epsi_stream_type::PSI_STREAM_AAC, false));

        let data = program.pmt_section().unwrap();
        assert_eq!(data.len(), 16 + 2 * 5);
        assert_eq!(data[0], epat_pid::PAT_TID_PMS as u8);
        assert_eq!(section_length(&data) + 3, data.len());
        assert_eq!((data[5] >> 1) & 0x1F, 3);
        assert_eq!(u16::from_be_bytes([data[8], data[9]]) & 0x1FFF, 0x100);
        assert_eq!(data[12], epsi_stream_type::PSI_STREAM_H264);
        assert_eq!(data[17], epsi_stream_type::PSI_STREAM_AAC);
        assert_eq!(crc32::gen_crc32(0xffff_ffff, &data), 0);
        assert_eq!(program.find_stream(0x101), Some(1));
    }
}

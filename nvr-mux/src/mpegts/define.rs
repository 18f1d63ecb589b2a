pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const PAT_PERIOD: i64 = 400 * 90;
pub const PCR_PERIOD: i64 = 100 * 90;

pub const MPEG_FLAG_IDR_FRAME: u16 = 0x0001;

pub mod epat_pid {
    pub const PAT_TID_PAS: u16 = 0x00;
    pub const PAT_TID_PMS: u16 = 0x02;
}

pub mod epes_stream_id {
    pub const PES_SID_AUDIO: u8 = 0xC0;
    pub const PES_SID_VIDEO: u8 = 0xE0;
}

pub mod epsi_stream_type {
    pub const PSI_STREAM_AAC: u8 = 0x0F;
    pub const PSI_STREAM_H264: u8 = 0x1B;
    pub const PSI_STREAM_H265: u8 = 0x24;
    pub const PSI_STREAM_PRIVATE_DATA: u8 = 0x06;
    pub const PSI_STREAM_AUDIO_OPUS: u8 = 0x9C;
}

pub mod ts_pid {
    pub const PID_PAT: u16 = 0x0000;
    pub const PID_PMT: u16 = 0x1000;
    pub const PID_FIRST_ES: u16 = 0x0100;
}

use {crate::h264::errors::H264Error, std::num::TryFromIntError};

#[derive(Debug, thiserror::Error)]
pub enum Mp4Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("value out of range: {0}")]
    OutOfRange(#[from] TryFromIntError),

    #[error("file would exceed 32-bit offsets")]
    FileTooLarge,

    #[error("timestamp went backwards on {track} track: {ts} after {last}")]
    NonMonotonicTimestamp {
        track: &'static str,
        ts: i64,
        last: i64,
    },

    #[error("packet has no timestamp")]
    MissingTimestamp,

    #[error("h264 error: {0}")]
    H264(#[from] H264Error),

    #[error("writer has no tracks")]
    NoTracks,
}

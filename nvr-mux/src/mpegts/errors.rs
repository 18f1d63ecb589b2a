use crate::bytesio::bytes_errors::BytesWriteError;

#[derive(Debug, thiserror::Error)]
pub enum MpegTsError {
    #[error("write error: {0}")]
    Write(#[from] BytesWriteError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("at most {0} elementary streams per program")]
    TooManyStreams(usize),

    #[error("no stream with pid {0}")]
    UnknownPid(u16),

    /// Recoverable: the writer should reset its timestamp tracking.
    #[error("non-monotonic dts on pid {pid}: {dts} after {last}")]
    NonMonotonicDts { pid: u16, dts: i64, last: i64 },
}

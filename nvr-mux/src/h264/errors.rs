#[derive(Debug, thiserror::Error)]
pub enum H264ErrorValue {
    #[error("nal unit length {length} exceeds remaining {remaining} bytes")]
    TruncatedNal { length: usize, remaining: usize },
    #[error("invalid avc decoder configuration: {0}")]
    InvalidDecoderConfig(&'static str),
    #[error("unsupported nal length size {0}")]
    UnsupportedLengthSize(u8),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct H264Error {
    pub value: H264ErrorValue,
}

impl From<H264ErrorValue> for H264Error {
    fn from(value: H264ErrorValue) -> Self {
        Self { value }
    }
}

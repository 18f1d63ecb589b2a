use crate::{index::IndexError, source::SourceError};
use nvr_broker::{BrokerApiError, RegistryError};
use nvr_core::ErrorKind;
use nvr_mux::{hls::HlsWriterError, mp4::Mp4Error};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("HLS writer error: {0}")]
    Hls(#[from] HlsWriterError),

    #[error("MP4 writer error: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("recording index error: {0}")]
    Index(#[from] IndexError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("broker API error: {0}")]
    Api(#[from] BrokerApiError),

    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

impl SessionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(SourceError::InvalidUrl { .. }) => ErrorKind::Fatal,
            Self::Source(SourceError::NoTracks) => ErrorKind::ProtocolDrift,
            Self::Hls(HlsWriterError::DirectoryUnusable(_)) => ErrorKind::Contention,
            Self::Hls(HlsWriterError::Io(e)) | Self::Mp4(Mp4Error::Io(e)) => nvr_core::error::io_error_kind(e),
            Self::Hls(HlsWriterError::NoSupportedTracks) => ErrorKind::Fatal,
            Self::Upstream(_) => ErrorKind::BrokerDeath,
            _ => ErrorKind::Transient,
        }
    }
}

impl From<SessionError> for nvr_core::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Source(e) => e.into(),
            SessionError::Index(e) => e.into(),
            SessionError::Registry(e) => e.into(),
            SessionError::Api(e) => e.into(),
            other => {
                let message = other.to_string();
                match other.kind() {
                    ErrorKind::Contention => Self::Contention(message),
                    ErrorKind::Fatal => Self::Fatal(message),
                    ErrorKind::ProtocolDrift => Self::ProtocolDrift(message),
                    ErrorKind::BrokerDeath => Self::BrokerDeath(message),
                    ErrorKind::Stuck => Self::Stuck(message),
                    ErrorKind::Transient => Self::Transient(message),
                }
            }
        }
    }
}

/// Reason handed back to façade callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FacadeError(pub String);

impl FacadeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<SessionError> for FacadeError {
    fn from(err: SessionError) -> Self {
        Self(err.to_string())
    }
}

impl From<RegistryError> for FacadeError {
    fn from(err: RegistryError) -> Self {
        Self(err.to_string())
    }
}

impl From<BrokerApiError> for FacadeError {
    fn from(err: BrokerApiError) -> Self {
        Self(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_session_error_kinds() {
        let unusable = SessionError::Hls(HlsWriterError::DirectoryUnusable(PathBuf::from("/ro")));
        assert_eq!(unusable.kind(), ErrorKind::Contention);
        assert!(matches!(nvr_core::Error::from(unusable), nvr_core::Error::Contention(_)));

        let closed = SessionError::Source(SourceError::Closed("eof".into()));
        assert!(nvr_core::Error::from(closed).is_retriable());

        let upstream = SessionError::Upstream("broker gone".into());
        assert_eq!(upstream.kind(), ErrorKind::BrokerDeath);
    }

    #[test]
    fn test_facade_error_is_plain_text() {
        let err = FacadeError::from(SessionError::Upstream("broker gone".into()));
        assert_eq!(err.to_string(), "upstream unavailable: broker gone");
    }
}

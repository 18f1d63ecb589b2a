use thiserror::Error;

/// Coarse error classes used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, EAGAIN, retriable muxer codes. Retry locally.
    Transient,
    /// Port in use, unwritable directory, open failure. One remediation, then surface.
    Contention,
    /// Broker answered with something unexpected. Treat as "not registered".
    ProtocolDrift,
    /// Byte flow stopped. Escalates to reload.
    Stuck,
    /// Broker stopped answering. Escalates to a supervised restart.
    BrokerDeath,
    /// Unrecoverable; propagate to the top level.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Resource contention: {0}")]
    Contention(String),

    #[error("Protocol drift: {0}")]
    ProtocolDrift(String),

    #[error("Stream stuck: {0}")]
    Stuck(String),

    #[error("Broker unavailable: {0}")]
    BrokerDeath(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Contention(_) => ErrorKind::Contention,
            Self::ProtocolDrift(_) | Self::Serialization(_) | Self::NotFound(_) => {
                ErrorKind::ProtocolDrift
            }
            Self::Stuck(_) => ErrorKind::Stuck,
            Self::BrokerDeath(_) => ErrorKind::BrokerDeath,
            Self::Fatal(_) | Self::Config(_) | Self::InvalidInput(_) => ErrorKind::Fatal,
            Self::Io(e) => io_error_kind(e),
        }
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Classify an I/O error.
#[must_use]
pub fn io_error_kind(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::TimedOut
        | Io::Interrupted
        | Io::WouldBlock
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::BrokenPipe => ErrorKind::Transient,
        Io::PermissionDenied | Io::AddrInUse | Io::NotFound | Io::AlreadyExists => {
            ErrorKind::Contention
        }
        _ => ErrorKind::Fatal,
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Broker API error types

use thiserror::Error;

/// Maximum response body accepted from the broker (4 MB); snapshots included.
pub const MAX_RESPONSE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BrokerApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream {0} is not registered")]
    NotRegistered(String),

    #[error("Response too large ({size} bytes, max {MAX_RESPONSE_SIZE})")]
    ResponseTooLarge { size: u64 },
}

impl BrokerApiError {
    /// The broker did not answer at all (as opposed to answering with an error).
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }
}

/// Check HTTP response status before processing body.
pub fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, BrokerApiError> {
    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(BrokerApiError::Http {
            status,
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

/// Read a response body, enforcing [`MAX_RESPONSE_SIZE`].
pub async fn bytes_with_limit(response: reqwest::Response) -> Result<bytes::Bytes, BrokerApiError> {
    if let Some(cl) = response.content_length() {
        if cl as usize > MAX_RESPONSE_SIZE {
            return Err(BrokerApiError::ResponseTooLarge { size: cl });
        }
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(BrokerApiError::ResponseTooLarge { size: bytes.len() as u64 });
    }
    Ok(bytes)
}

/// Read a response body with size limit and deserialize as JSON.
pub async fn json_with_limit<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BrokerApiError> {
    let bytes = bytes_with_limit(response).await?;
    serde_json::from_slice(&bytes).map_err(Into::into)
}

impl From<reqwest::Error> for BrokerApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: err.url().map(ToString::to_string).unwrap_or_default(),
            };
        }
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<BrokerApiError> for nvr_core::Error {
    fn from(err: BrokerApiError) -> Self {
        match err {
            BrokerApiError::Network(_) | BrokerApiError::Timeout { .. } => Self::Transient(err.to_string()),
            BrokerApiError::NotRegistered(name) => Self::NotFound(name),
            BrokerApiError::Http { .. } | BrokerApiError::Parse(_) | BrokerApiError::ResponseTooLarge { .. } => {
                Self::ProtocolDrift(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvr_core::ErrorKind;

    #[test]
    fn test_error_display_http() {
        let err = BrokerApiError::Http {
            status: reqwest::StatusCode::NOT_FOUND,
            url: "http://127.0.0.1:1984/api/streams".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 404 Not Found for http://127.0.0.1:1984/api/streams");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: BrokerApiError = json_err.into();
        assert!(matches!(err, BrokerApiError::Parse(_)));
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_core_error_mapping() {
        let err: nvr_core::Error = BrokerApiError::Network("refused".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err: nvr_core::Error = BrokerApiError::Parse("missing producers".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolDrift);

        let err: nvr_core::Error = BrokerApiError::NotRegistered("cam".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolDrift);
    }
}

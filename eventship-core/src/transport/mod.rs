//! Network transport for batch uploads
//!
//! A [`Transport`] performs one POST per batch and carries a mutable
//! anonymous-id header that the uploader sets before every send.
//! [`UploadOutcome`] is how the uploader decides what to do next.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;

/// Failure categories reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorStatus {
    /// 400: malformed batch
    BadRequest,
    /// 401: invalid write key
    Unauthorized,
    /// 404: source disabled
    NotFound,
    /// 413: batch too large
    PayloadTooLarge,
    /// Any other 4xx/5xx
    Retry(u16),
    /// No connection could be made
    NetworkUnavailable,
    /// Anything else
    Unknown,
}

impl NetworkErrorStatus {
    /// Map a non-success HTTP status code
    pub fn from_status(code: u16) -> Self {
        match code {
            400 => NetworkErrorStatus::BadRequest,
            401 => NetworkErrorStatus::Unauthorized,
            404 => NetworkErrorStatus::NotFound,
            413 => NetworkErrorStatus::PayloadTooLarge,
            400..=599 => NetworkErrorStatus::Retry(code),
            _ => NetworkErrorStatus::Unknown,
        }
    }
}

/// A failed send with its classification and a human-readable cause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub status: NetworkErrorStatus,
    pub cause: String,
}

impl SendFailure {
    pub fn new(status: NetworkErrorStatus, cause: impl Into<String>) -> Self {
        Self {
            status,
            cause: cause.into(),
        }
    }
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.status, self.cause)
    }
}

/// What the uploader does with a send result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Remove the batch and move on
    Success(String),
    /// Wait and send the same batch again
    Retryable(SendFailure),
    /// Remove the batch without retrying and move on
    Drop(SendFailure),
    /// Stop the run and invalidate the client
    InvalidWriteKey(SendFailure),
    /// Stop the run, keep the batch, disable uploads
    SourceDisabled(SendFailure),
}

impl UploadOutcome {
    pub fn classify(result: std::result::Result<String, SendFailure>) -> Self {
        match result {
            Ok(body) => UploadOutcome::Success(body),
            Err(failure) => match failure.status {
                NetworkErrorStatus::BadRequest | NetworkErrorStatus::PayloadTooLarge => {
                    UploadOutcome::Drop(failure)
                }
                NetworkErrorStatus::Unauthorized => UploadOutcome::InvalidWriteKey(failure),
                NetworkErrorStatus::NotFound => UploadOutcome::SourceDisabled(failure),
                NetworkErrorStatus::Retry(_)
                | NetworkErrorStatus::NetworkUnavailable
                | NetworkErrorStatus::Unknown => UploadOutcome::Retryable(failure),
            },
        }
    }
}

/// Sends batch payloads to the data plane
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one batch payload, returning the response body on success
    async fn send_data(&self, payload: &str) -> std::result::Result<String, SendFailure>;

    /// Set the base64 anonymous-id header used by the next `send_data`
    fn update_anonymous_id_header(&self, encoded: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert_eq!(
            NetworkErrorStatus::from_status(400),
            NetworkErrorStatus::BadRequest
        );
        assert_eq!(
            NetworkErrorStatus::from_status(401),
            NetworkErrorStatus::Unauthorized
        );
        assert_eq!(
            NetworkErrorStatus::from_status(404),
            NetworkErrorStatus::NotFound
        );
        assert_eq!(
            NetworkErrorStatus::from_status(413),
            NetworkErrorStatus::PayloadTooLarge
        );
        assert_eq!(
            NetworkErrorStatus::from_status(429),
            NetworkErrorStatus::Retry(429)
        );
        assert_eq!(
            NetworkErrorStatus::from_status(503),
            NetworkErrorStatus::Retry(503)
        );
        assert_eq!(
            NetworkErrorStatus::from_status(302),
            NetworkErrorStatus::Unknown
        );
    }

    #[test]
    fn test_classify() {
        let fail = |status| Err(SendFailure::new(status, "x"));

        assert!(matches!(
            UploadOutcome::classify(Ok("OK".to_string())),
            UploadOutcome::Success(_)
        ));
        for status in [
            NetworkErrorStatus::BadRequest,
            NetworkErrorStatus::PayloadTooLarge,
        ] {
            assert!(matches!(
                UploadOutcome::classify(fail(status)),
                UploadOutcome::Drop(_)
            ));
        }
        assert!(matches!(
            UploadOutcome::classify(fail(NetworkErrorStatus::Unauthorized)),
            UploadOutcome::InvalidWriteKey(_)
        ));
        assert!(matches!(
            UploadOutcome::classify(fail(NetworkErrorStatus::NotFound)),
            UploadOutcome::SourceDisabled(_)
        ));
        for status in [
            NetworkErrorStatus::Retry(500),
            NetworkErrorStatus::NetworkUnavailable,
            NetworkErrorStatus::Unknown,
        ] {
            assert!(matches!(
                UploadOutcome::classify(fail(status)),
                UploadOutcome::Retryable(_)
            ));
        }
    }
}

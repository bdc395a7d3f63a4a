//! Error types for larder-maint
//!
//! `ServiceError` covers every failure talking to the recipe service and
//! classifies which ones are worth retrying. `StageError` is what a stage
//! returns when it cannot complete at all (as opposed to individual item
//! failures, which are recorded in the stage report).

use thiserror::Error;

/// Recipe service error
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection refused, reset, DNS failure
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Non-success HTTP status
    #[error("Service returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Request rejected before it was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Retries used up on a transient failure
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ServiceError>,
    },
}

impl ServiceError {
    /// Whether the failure may succeed if repeated unchanged
    ///
    /// Transport failures, timeouts, HTTP 429 and 5xx are transient; every
    /// other client error is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Network(_) | ServiceError::Timeout(_) => true,
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Decode(_)
            | ServiceError::InvalidRequest(_)
            | ServiceError::RetriesExhausted { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Status { status, .. } => Some(*status),
            ServiceError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(err.to_string())
        } else if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ServiceError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

/// Stage-level failure
#[derive(Debug, Error)]
pub enum StageError {
    /// Reading from the service failed (after retries)
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Checkpoint store could not be opened, read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Stage configuration rejected at run time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run was cancelled before the stage finished
    #[error("Cancelled")]
    Cancelled,

    /// Writing a report artifact failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Common library error
    #[error(transparent)]
    Common(#[from] larder_common::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ServiceError::Network("reset".into()).is_transient());
        assert!(ServiceError::Timeout("30s".into()).is_transient());
        assert!(ServiceError::Status { status: 429, message: String::new() }.is_transient());
        assert!(ServiceError::Status { status: 503, message: String::new() }.is_transient());
        assert!(!ServiceError::Status { status: 404, message: String::new() }.is_transient());
        assert!(!ServiceError::Status { status: 422, message: String::new() }.is_transient());
        assert!(!ServiceError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_exhausted_is_not_transient_but_keeps_status() {
        let err = ServiceError::RetriesExhausted {
            attempts: 4,
            last: Box::new(ServiceError::Status {
                status: 502,
                message: "bad gateway".into(),
            }),
        };
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(502));
    }
}

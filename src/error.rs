use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use thiserror::Error;

use crate::proxy::{full_body, RelayBody};

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Inbound request errors
    #[error("{0}")]
    BadTarget(String),

    // Upstream errors
    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Upstream rejected CONNECT with status {status}")]
    ConnectRejected { status: StatusCode, body: Bytes },

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Relay transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RelayError::BadTarget(_) => StatusCode::BAD_REQUEST,

            // Upstream status passes through verbatim
            RelayError::ConnectRejected { status, .. } => *status,

            // 504 Gateway Timeout
            RelayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            RelayError::UpstreamConnect(_)
            | RelayError::Transport(_)
            | RelayError::InvalidConfig(_)
            | RelayError::Io(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, RelayError::BadTarget(_))
    }

    /// Convert the failure into the response written to the inbound client.
    ///
    /// A rejected CONNECT surfaces the upstream's own body; everything else
    /// gets a plain-text description.
    pub fn into_response(self) -> Response<RelayBody> {
        let status = self.status_code();
        let body = match self {
            RelayError::ConnectRejected { body, .. } => body,
            other => Bytes::from(other.to_string()),
        };

        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
        response
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RelayError {
    fn from(err: hyper::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RelayError {
    fn from(_: url::ParseError) -> Self {
        RelayError::BadTarget("invalid url".to_string())
    }
}

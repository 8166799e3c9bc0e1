// Query-path error kinds and their single point of HTTP translation.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quill_wire::ErrorKind;

/// Non-standard status nginx popularized for clients that closed the
/// connection before the response was written.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("the request body is too large")]
    BodyTooLarge,
    #[error("no org id")]
    MissingTenant,
    #[error("too many outstanding requests")]
    TooManyOutstanding,
    #[error("the query deadline was exceeded")]
    DeadlineExceeded,
    #[error("the query was cancelled")]
    Cancelled,
    #[error("the frontend is shutting down")]
    Stopped,
    #[error("lost contact with the querier executing this query")]
    WorkerLost,
    /// A failure that arrived with an explicit status; passed through
    /// verbatim.
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Internal(String),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            QueryError::MissingTenant => StatusCode::UNAUTHORIZED,
            QueryError::TooManyOutstanding => StatusCode::TOO_MANY_REQUESTS,
            QueryError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Cancelled => StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                .expect("499 is a valid status code"),
            QueryError::Status { status, .. } => StatusCode::from_u16(*status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            QueryError::Stopped | QueryError::WorkerLost | QueryError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Rebuild the error a querier reported on the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Cancelled => QueryError::Cancelled,
            ErrorKind::DeadlineExceeded => QueryError::DeadlineExceeded,
            ErrorKind::Internal => QueryError::Internal(message),
        }
    }
}

/// Every failure on the query path is written through here so the
/// status mapping lives in one place.
pub fn write_error(err: &QueryError) -> Response {
    let status = err.status();
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "query failed");
    }
    (status, err.to_string()).into_response()
}

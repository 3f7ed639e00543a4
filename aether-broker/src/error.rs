//! Error types for the broker crate.

use aether_compute::{ComputeError, ErrorKind};
use aether_core::CoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Reason shown to callers for failures whose details stay in the log.
pub const INTERNAL_REASON: &str = "internal error";

/// Errors raised by the bus transport and the HTTP API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// An error from the compute engine.
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// A path or body parameter failed validation.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// The request body is malformed or contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The AMQP connection or channel failed.
    #[error("message bus error: {0}")]
    Bus(#[from] lapin::Error),

    #[error("could not serialise reply: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Binaries the daemon shells out to are not installed.
    #[error("missing host dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// The message a remote caller may see. Internal failures are reduced
    /// to [`INTERNAL_REASON`].
    #[must_use]
    pub fn public_reason(&self) -> String {
        match self {
            Self::Compute(e) => compute_reason(e),
            Self::Invalid(_) | Self::InvalidRequest(_) => self.to_string(),
            Self::Bus(_) | Self::Serialize(_) | Self::MissingDependencies(_) | Self::Io(_) => {
                INTERNAL_REASON.to_owned()
            }
        }
    }
}

/// The caller-facing message of a compute error.
#[must_use]
pub fn compute_reason(err: &ComputeError) -> String {
    if err.kind() == ErrorKind::Internal {
        INTERNAL_REASON.to_owned()
    } else {
        err.to_string()
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            BrokerError::Compute(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::ExternalTool => StatusCode::BAD_GATEWAY,
                ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            BrokerError::Invalid(_) | BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::Bus(_)
            | BrokerError::Serialize(_)
            | BrokerError::MissingDependencies(_)
            | BrokerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({"error": self.public_reason()}))).into_response()
    }
}

use core::error::Error;

use error_stack::Report;
use poem::http::StatusCode;
use tracing::error;
use tracing::warn;

use crate::domain::RegistrationError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Caller mistakes map to 400, storage failures to 500.
pub fn registration_error(report: Report<RegistrationError>) -> poem::Error {
    let status = match report.current_context() {
        RegistrationError::InvalidPayload { .. } | RegistrationError::Serialization { .. } => {
            warn!("rejected registry request: {report:?}");
            StatusCode::BAD_REQUEST
        }
        RegistrationError::Persistence => {
            error!("registry request failed: {report:?}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    poem::Error::from_string(report.current_context().to_string(), status)
}

pub fn invalid_body(message: impl std::fmt::Display) -> poem::Error {
    poem::Error::from_string(format!("invalid request body: {message}"), StatusCode::BAD_REQUEST)
}

//! AWS adapter error types

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use settle::ApiError;
use thiserror::Error;

/// Code used for SDK failures that carry no service error code
/// (dispatch failures, timeouts, unparseable responses)
pub const UNKNOWN_ERROR_CODE: &str = "Unknown";

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid attribute '{}': {}", .name, .reason)]
    InvalidAttribute { name: String, reason: String },

    #[error("{0} response carried no identifier")]
    MissingIdentifier(&'static str),

    #[error("AWS API error: {0}")]
    Api(#[from] ApiError),

    #[error("Settle error: {0}")]
    Settle(#[from] settle::Error),
}

impl AwsError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AwsError::InvalidAttribute {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<AwsError> for settle::Error {
    fn from(err: AwsError) -> Self {
        match err {
            AwsError::Api(e) => settle::Error::Api(e),
            AwsError::Settle(e) => e,
            AwsError::MissingIdentifier(op) => {
                settle::Error::MissingId(format!("{} response carried no identifier", op))
            }
            other => settle::Error::InvalidConfig(other.to_string()),
        }
    }
}

/// Reduce an SDK error to the engine's `{ code, message }` form
pub fn api_error<E, R>(err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().unwrap_or(UNKNOWN_ERROR_CODE).to_string();
    let message = match err.message() {
        Some(message) => message.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    tracing::debug!("EC2 call failed: {}: {}", code, message);
    ApiError::new(code, message)
}

pub type Result<T> = std::result::Result<T, AwsError>;

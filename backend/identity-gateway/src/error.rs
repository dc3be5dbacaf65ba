use thiserror::Error;
use tonic::{Code, Status};

/// Failure looking up a user profile in the identity provider
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user not found")]
    NotFound,

    #[error("invalid user id")]
    InvalidUserId,

    #[error("directory credentials not configured")]
    NotConfigured,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected directory response: {0}")]
    Internal(String),
}

impl DirectoryError {
    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryError::NotFound => "not_found",
            DirectoryError::InvalidUserId => "invalid_user_id",
            DirectoryError::NotConfigured => "not_configured",
            DirectoryError::Unavailable(_) => "unavailable",
            DirectoryError::Internal(_) => "internal",
        }
    }

    /// Convert to gRPC Status for wire protocol
    pub fn to_status(&self) -> Status {
        match self {
            DirectoryError::NotFound => Status::new(Code::NotFound, "user not found"),
            DirectoryError::InvalidUserId => Status::new(Code::InvalidArgument, "invalid user id"),
            DirectoryError::NotConfigured | DirectoryError::Unavailable(_) => {
                Status::new(Code::Unavailable, "unavailable")
            }
            // Don't leak provider responses to callers
            DirectoryError::Internal(_) => Status::new(Code::Internal, "internal error"),
        }
    }
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DirectoryError::Internal(err.to_string())
        } else {
            DirectoryError::Unavailable(err.to_string())
        }
    }
}

impl From<DirectoryError> for Status {
    fn from(err: DirectoryError) -> Self {
        err.to_status()
    }
}

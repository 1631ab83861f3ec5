use thiserror::Error;

use crate::identity::ClientId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Item source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Answer upload failed: {0}")]
    SinkFailure(String),

    #[error("No captcha assigned to this client")]
    NoAssignment,

    #[error("Session belongs to another client")]
    Forbidden,

    #[error("Client {0} already holds an assignment")]
    AlreadyAssigned(ClientId),

    #[error("Item {0} is already assigned")]
    ItemTaken(String),

    #[error("Verification not confirmed after {attempts} attempts")]
    VerificationTimeout { attempts: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(value: reqwest::Error) -> Self {
        Self::SourceUnavailable(value.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(value: serde_json::Error) -> Self {
        Self::SourceUnavailable(format!("malformed payload: {value}"))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

use axum::http::StatusCode;
use tapvault_types::UnknownAction;
use thiserror::Error;

/// Every way a single action request can fail.
///
/// Validation and business-rule failures map to 400; anything that went
/// wrong talking to the data service maps to 500.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),
    #[error("Missing required parameters: userId and action")]
    MissingParameters,
    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("User account not found")]
    NotFound,
    #[error("{0}")]
    Rejected(&'static str),
    #[error("Concurrent update conflict, please retry")]
    Conflict,
    #[error("Database operation failed: {0}")]
    Database(String),
}

impl ActionError {
    pub fn status(&self) -> StatusCode {
        match self {
            ActionError::Conflict | ActionError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<tapvault_gateway::Error> for ActionError {
    fn from(err: tapvault_gateway::Error) -> Self {
        ActionError::Database(err.to_string())
    }
}

use axum::http::StatusCode;
use tallybook_core::ModelError;
use tallybook_storage::{StorageError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("A learning run is already committing rules")]
    CommitInProgress,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Rule storage unavailable: {0}")]
    Unavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::CommitInProgress => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RuleNotFound(id) => ApiError::NotFound(format!("rule {id}")),
            StorageError::TransactionNotFound(id) => ApiError::NotFound(format!("transaction {id}")),
            StorageError::InvalidRule(e) => ApiError::Validation(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CommitInProgress => ApiError::CommitInProgress,
            StoreError::ColdStart(e) => ApiError::Unavailable(e.to_string()),
            StoreError::Storage(e) => e.into(),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

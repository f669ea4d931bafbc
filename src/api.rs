use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::database::CustomDatabaseError;
use crate::redis::CustomRedisError;
use crate::storage::StorageError;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigResponseMeta {
    #[serde(rename = "type")]
    pub config_type: String,
    pub has_experiment: bool,
    pub experiment_id: Option<i32>,
    pub flow_id: Option<i32>,
}

/// Response shape for the resolve endpoint: the merged configuration plus
/// a meta block telling the client which experiment/flow (if any) it is in.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigResponse {
    pub success: bool,
    pub data: Value,
    pub meta: ConfigResponseMeta,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub confirmation_id: i32,
    pub status: String,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct FlowStats {
    pub flow_id: i32,
    pub ratio: Option<i32>,
    pub assigned_count: i64,
    pub selection_count: i64,
    pub percentage: f64,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct ExperimentStatsResponse {
    pub experiment_id: i32,
    pub total_assignments: i64,
    pub flows: Vec<FlowStats>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("Empty type in request")]
    EmptyConfigType,
    #[error("No principal_id in request")]
    MissingPrincipalId,

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("No experiment with this id")]
    ExperimentNotFound,
    #[error("No assignment matches this confirmation")]
    ConfirmationMismatch,
    #[error("a conflicting row already exists")]
    DuplicateEntity,

    #[error("failed to parse stored data")]
    DataParsingError,
    #[error("counter store unavailable")]
    CounterUnavailable,
    #[error("database unavailable")]
    DatabaseUnavailable,
    #[error("Timed out while fetching data")]
    TimeoutError,
}

impl IntoResponse for ConfigError {
    fn into_response(self) -> Response {
        match self {
            ConfigError::RequestDecodingError(_)
            | ConfigError::RequestParsingError(_)
            | ConfigError::EmptyConfigType
            | ConfigError::MissingPrincipalId
            | ConfigError::InvalidDefinition(_) => (StatusCode::BAD_REQUEST, self.to_string()),

            ConfigError::ExperimentNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            ConfigError::ConfirmationMismatch | ConfigError::DuplicateEntity => {
                (StatusCode::CONFLICT, self.to_string())
            }

            ConfigError::DataParsingError
            | ConfigError::CounterUnavailable
            | ConfigError::DatabaseUnavailable
            | ConfigError::TimeoutError => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

impl From<CustomRedisError> for ConfigError {
    fn from(e: CustomRedisError) -> Self {
        match e {
            CustomRedisError::NotFound => ConfigError::DataParsingError,
            CustomRedisError::Timeout(_) => ConfigError::TimeoutError,
            CustomRedisError::Other(e) => {
                tracing::error!("redis error: {}", e);
                ConfigError::CounterUnavailable
            }
        }
    }
}

impl From<CustomDatabaseError> for ConfigError {
    fn from(e: CustomDatabaseError) -> Self {
        match e {
            CustomDatabaseError::NotFound => ConfigError::DataParsingError,
            CustomDatabaseError::Timeout(_) => ConfigError::TimeoutError,
            CustomDatabaseError::Other(e) => {
                tracing::error!("failed to get connection: {}", e);
                ConfigError::DatabaseUnavailable
            }
        }
    }
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => ConfigError::DataParsingError,
            // unique violations are recovered inside get_or_create; one
            // leaking this far is a bug worth surfacing as a 503
            StorageError::UniqueViolation => {
                tracing::error!("unhandled unique violation reached the api layer");
                ConfigError::DatabaseUnavailable
            }
            StorageError::InvalidData(msg) => {
                tracing::error!("invalid stored data: {}", msg);
                ConfigError::DataParsingError
            }
            StorageError::Unavailable(msg) => {
                tracing::error!("failed to get connection: {}", msg);
                ConfigError::DatabaseUnavailable
            }
            StorageError::Database(e) => {
                tracing::error!("pg error: {}", e);
                ConfigError::DatabaseUnavailable
            }
        }
    }
}

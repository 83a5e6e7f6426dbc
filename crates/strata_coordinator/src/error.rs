//! Error taxonomy for coordinator operations.

use std::time::Duration;

use strata_plan::{Endpoint, QueryId};
use thiserror::Error;

use crate::status::{Status, StatusCode};

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Per-operation failures; each maps to a stable [`StatusCode`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The planner could not build or start an execution.
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("statement not supported: {0}")]
    Unsupported(String),

    /// Fragment instances could not be delivered.
    #[error("dispatch to {endpoint} failed: {message}")]
    Dispatch { endpoint: Endpoint, message: String },

    #[error("no pooled client for {endpoint} within {waited:?}")]
    ClientPoolExhausted { endpoint: Endpoint, waited: Duration },

    #[error("front-end memory exhausted: requested {requested} bytes, {available} available")]
    MemoryExhausted { requested: u64, available: u64 },

    #[error("query {0} timed out")]
    Timeout(QueryId),

    #[error("query {0} was canceled")]
    Canceled(QueryId),

    /// A load-file failure with an optional message and wrapped cause.
    #[error("load file failed: {}", .message.as_deref().unwrap_or("no detail"))]
    LoadFile {
        message: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn load_file(message: impl Into<String>) -> Self {
        Self::LoadFile {
            message: Some(message.into()),
            source: None,
        }
    }

    pub fn load_file_caused_by(
        message: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::LoadFile {
            message,
            source: Some(Box::new(source)),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Planning(_) => StatusCode::PlanningError,
            Self::Unsupported(_) => StatusCode::StatementNotSupported,
            Self::Dispatch { .. } => StatusCode::DispatchError,
            Self::ClientPoolExhausted { .. } => StatusCode::ClientPoolExhausted,
            Self::MemoryExhausted { .. } => StatusCode::MemoryNotEnough,
            Self::Timeout(_) => StatusCode::QueryTimeout,
            Self::Canceled(_) => StatusCode::QueryCanceled,
            Self::LoadFile { .. } => StatusCode::LoadFileError,
            Self::Internal(_) => StatusCode::InternalServerError,
        }
    }

    /// Status reported to the client for this error.
    pub fn to_status(&self) -> Status {
        Status::error(self.status_code(), self.to_string())
    }
}

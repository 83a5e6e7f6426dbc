//! Numeric operation statuses and retry classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable numeric code per error category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Success = 200,
    MultipleError = 302,
    InternalServerError = 305,
    DispatchError = 306,
    SystemReadOnly = 312,
    StorageEngineNotReady = 313,
    MemoryNotEnough = 320,
    ClientPoolExhausted = 330,
    PlanningError = 410,
    StatementNotSupported = 411,
    QueryTimeout = 420,
    QueryCanceled = 421,
    WriteProcessError = 507,
    WriteProcessReject = 508,
    LoadFileError = 707,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Codes a write may be resent for.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InternalServerError
                | Self::DispatchError
                | Self::SystemReadOnly
                | Self::StorageEngineNotReady
                | Self::WriteProcessError
                | Self::WriteProcessReject
                | Self::ClientPoolExhausted
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// Outcome of one operation as reported to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
    /// Set by the coordinator on retryable write failures.
    pub need_retry: bool,
    /// Per-target statuses behind a [`StatusCode::MultipleError`].
    pub sub_status: Vec<Status>,
}

impl Status {
    pub fn success() -> Self {
        Self::new(StatusCode::Success, None)
    }

    pub fn new(code: StatusCode, message: Option<String>) -> Self {
        Self {
            code,
            message,
            need_retry: false,
            sub_status: Vec::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self::new(code, Some(message.into()))
    }

    pub fn multiple(sub_status: Vec<Status>) -> Self {
        Self {
            code: StatusCode::MultipleError,
            message: Some(format!("{} sub-operations reported a status", sub_status.len())),
            need_retry: false,
            sub_status,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// Whether a failed write with this status may be resent.
    ///
    /// A multiple-error status qualifies when no part is a non-retryable
    /// failure; one with no parts at all qualifies.
    pub fn needs_retry(&self) -> bool {
        match self.code {
            StatusCode::MultipleError => self
                .sub_status
                .iter()
                .all(|sub| sub.is_success() || sub.needs_retry()),
            code => code.is_retryable(),
        }
    }

    pub fn set_need_retry(&mut self, need_retry: bool) {
        self.need_retry = need_retry;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

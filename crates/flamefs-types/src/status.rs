use std::fmt;

use crate::status_code::{self, status_code_t, StatusCode, TransactionCode};

/// An error status carrying a numeric code and an optional message.
///
/// `#[must_use]` keeps callers from silently dropping error statuses.
#[derive(Debug, Clone)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    /// Create a status with just a code.
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    /// Return the numeric status code.
    pub fn code(&self) -> status_code_t {
        self.code
    }

    /// Return the optional message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success (code == OK).
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Whether a transaction seeing this status may be retried without
    /// idempotency guarantees. `MaybeCommitted` is deliberately excluded:
    /// it is retriable only when the caller can prove idempotency.
    pub fn is_txn_retryable(&self) -> bool {
        matches!(
            self.code,
            TransactionCode::CONFLICT
                | TransactionCode::THROTTLED
                | TransactionCode::TOO_OLD
                | TransactionCode::RETRYABLE
        )
    }

    /// Whether this status is `Txn::MaybeCommitted`.
    pub fn is_maybe_committed(&self) -> bool {
        self.code == TransactionCode::MAYBE_COMMITTED
    }

    /// Produce a human-readable description like `"Meta::NotFound(3000) no such file"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

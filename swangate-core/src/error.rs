use std::error::Error as _;
use std::time::Duration;

use thiserror::Error;

use crate::encoding::EncodeError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed request body or missing parameters.
    #[error("{0}")]
    Validation(String),
    /// Unknown id, wrong token, expired session, or finished transaction.
    /// The message never says which.
    #[error("Invalid token")]
    Unauthorized,
    #[error("{}", postgres_message(.0))]
    Postgres(#[from] tokio_postgres::Error),
    /// COMMIT reached a transaction the server had already aborted, so it
    /// rolled back instead.
    #[error("commit unexpectedly resulted in rollback")]
    CommitRolledBack,
    #[error("{operation} did not complete within {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("no free {0} slot available")]
    CapacityExhausted(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EncodeError> for ServerError {
    fn from(err: EncodeError) -> Self {
        ServerError::Protocol(err.to_string())
    }
}

/// Text of a driver error as callers should see it: the server's report
/// when there is one, otherwise the driver's message followed by its causes.
pub fn postgres_message(err: &tokio_postgres::Error) -> String {
    if let Some(db) = err.as_db_error() {
        let mut message = format!(
            "{}: {} (SQLSTATE {})",
            db.severity(),
            db.message(),
            db.code().code()
        );
        if let Some(detail) = db.detail() {
            message.push_str(" DETAIL: ");
            message.push_str(detail);
        }
        return message;
    }

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

//! Public error type for the storage layer.
//!
//! Mirrors the split seen in `datafetch::error::DataFetchError` and
//! `http::error::ApiError` in the teacher crate: a narrow `thiserror` enum at
//! the public boundary, with `anyhow`/`sqlx` errors folded into `Internal`.

use thiserror::Error;

/// The typed error kinds from the error-handling design (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    /// Inputs violate declared shape or range.
    #[error("argument error: {0}")]
    Argument(String),

    /// Uniqueness/add-collision; unknown backend; schema non-editable edit.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// Use of a cursor after exhaustion or outside its owning transaction.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Cursor moved in the wrong direction, or used before `hasCursor`.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Feature requested outside the accepted SQL grammar or cursor subset.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Query compiler could not interpret a SQL fragment.
    #[error("sql parse error at {fragment:?}: {message}")]
    SqlParse { message: String, fragment: String },

    /// Backend reported an error; the backend's message is attached.
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Error::Constraint(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Error::NotImplemented(msg.into())
    }

    pub fn sql_parse(message: impl Into<String>, fragment: impl Into<String>) -> Self {
        Error::SqlParse {
            message: message.into(),
            fragment: fragment.into(),
        }
    }

    /// The stable kind name, used by tests and logging (matches spec §7 table).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Argument(_) => "ArgumentException",
            Error::Constraint(_) => "ConstraintError",
            Error::InvalidState(_) => "InvalidStateError",
            Error::InvalidOperation(_) => "InvalidOperationError",
            Error::NotImplemented(_) => "NotImplementedError",
            Error::SqlParse { .. } => "SqlParseError",
            Error::Internal(_) => "InternalError",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e)
    }
}

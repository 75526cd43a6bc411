//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns `Result<T, Error>`. Variants
//! map onto the error taxonomy of the storage/execution design: parse errors
//! from the SQL frontend, schema/constraint/semantic errors from DDL and DML,
//! lock-timeout and transaction-state errors from the ACID layer, and a
//! catch-all I/O variant for filesystem failures.

use std::fmt;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("constraint error: {0}")]
    Constraint(String),

    #[error("semantic error: {0}")]
    Semantic(String),

    #[error("refusing to execute: {0}")]
    Safety(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("lock timeout after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("transaction state error: {0}")]
    TransactionState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn schema(msg: impl fmt::Display) -> Error {
        Error::Schema(msg.to_string())
    }

    pub fn constraint(msg: impl fmt::Display) -> Error {
        Error::Constraint(msg.to_string())
    }

    pub fn semantic(msg: impl fmt::Display) -> Error {
        Error::Semantic(msg.to_string())
    }

    pub fn unsupported(msg: impl fmt::Display) -> Error {
        Error::Unsupported(msg.to_string())
    }

    pub fn parse(msg: impl fmt::Display) -> Error {
        Error::Parse(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable_and_human_readable() {
        assert_eq!(
            Error::schema("table accounts not found").to_string(),
            "schema error: table accounts not found"
        );
        assert_eq!(
            Error::LockTimeout(std::time::Duration::from_secs(10)).to_string(),
            "lock timeout after 10s"
        );
        assert_eq!(
            Error::Safety("DELETE without WHERE".into()).to_string(),
            "refusing to execute: DELETE without WHERE"
        );
    }
}

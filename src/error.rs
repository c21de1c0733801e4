/// Error types shared by every component of the crate.
///
/// Errors fall into four families:
/// - schema errors (unknown column, wrong value type, bad group-by declaration),
///   reported to the caller of the offending operation which then has no effect
/// - invariant violations (duplicate keys, missing rows)
/// - transport errors, surfaced as [`Error::Io`] and classified with
///   [`Error::is_disconnect`]
/// - protocol errors raised while decoding a replication stream, which are
///   fatal for the connection that produced them

use crate::column::ColumnType;
use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A column name is not part of the table schema.
    #[error("Column '{0}' not found")]
    UnknownColumn(String),

    /// Two columns in one schema share a name.
    #[error("Column '{0}' is declared more than once")]
    DuplicateColumn(String),

    /// A group-by declaration names the same column twice.
    #[error("Column '{0}' is already a group-by column")]
    DuplicateGroupColumn(String),

    /// A value does not match the declared type of its column.
    ///
    /// `actual` is `None` when the value was the empty sentinel.
    #[error("Type mismatch for column '{column}': expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        actual: Option<ColumnType>,
    },

    /// An aggregate cannot be computed over the given source column.
    #[error("Aggregate '{name}' cannot be computed over column '{column}': {reason}")]
    InvalidAggregate {
        name: String,
        column: String,
        reason: String,
    },

    /// A unique index (column index or indexed dictionary) already holds the key.
    #[error("Cannot add duplicate item to indexed column '{0}'")]
    DuplicateKey(String),

    #[error("Row {0} not found")]
    RowNotFound(usize),

    #[error("Row {0} already exists")]
    RowExists(usize),

    /// A decoded field id has no entry in the field mapping.
    #[error("Unknown wire field id {0}")]
    UnknownFieldId(u16),

    /// An update or delete referenced a row the peer never added.
    #[error("Unknown remote row {0}")]
    UnknownRemoteRow(u64),

    /// The peer added a row id that is still live.
    #[error("Remote row {0} was added twice")]
    DuplicateRemoteRow(u64),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true when the error is a peer disconnect rather than a fault.
    ///
    /// Resets, aborts, broken pipes and end-of-stream all count as a normal
    /// disconnect: only the affected connection is torn down.
    pub fn is_disconnect(&self) -> bool {
        // Frame bodies are fully buffered before decoding, so a codec error is
        // always corruption, never a closed stream.
        match self {
            Error::Io(err) => is_disconnect_kind(err.kind()),
            _ => false,
        }
    }

    /// Returns true for errors caused by the schema rather than the data.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownColumn(_)
                | Error::DuplicateColumn(_)
                | Error::DuplicateGroupColumn(_)
                | Error::TypeMismatch { .. }
                | Error::InvalidAggregate { .. }
        )
    }
}

fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let reset = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_disconnect());

        let eof = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_disconnect());

        let denied = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!denied.is_disconnect());

        assert!(!Error::UnknownFieldId(7).is_disconnect());
    }

    #[test]
    fn test_schema_errors() {
        assert!(Error::UnknownColumn("x".to_string()).is_schema_error());
        assert!(Error::TypeMismatch {
            column: "x".to_string(),
            expected: ColumnType::Int32,
            actual: Some(ColumnType::String),
        }
        .is_schema_error());
        assert!(!Error::RowNotFound(3).is_schema_error());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::UnknownColumn("price".to_string()).to_string(),
            "Column 'price' not found"
        );
        assert_eq!(
            Error::DuplicateKey("id".to_string()).to_string(),
            "Cannot add duplicate item to indexed column 'id'"
        );
    }
}

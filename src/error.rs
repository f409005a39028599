//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns `Result<T>`, aliased below.
//! Variant names mirror the taxonomy in the toolchain's design: format errors
//! are always fatal, validation errors are raised before any mutation, and
//! the write/server variants carry enough context for a caller to decide
//! whether to keep going.

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed archive framing, truncated BSON, or a missing metadata file.
    /// Always fatal.
    #[error("format error: {0}")]
    FormatError(String),

    /// A disallowed option combination or namespace, raised before any I/O or
    /// server mutation has happened.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A per-document write failure the restore pipeline is allowed to skip
    /// unless `stop_on_error` is set: duplicate key (11000), document
    /// validation failure (121), or an unacknowledged write.
    #[error("ignorable write error (code {code:?}) on {namespace}: {message}")]
    IgnorableWriteError {
        namespace: String,
        code: Option<i32>,
        message: String,
    },

    /// A server error that the restore pipeline knows how to recover from by
    /// retrying after a corrective command (e.g. a mixed-schema timeseries
    /// collMod).
    #[error("recoverable server error (code {code}) on {namespace}: {message}")]
    RecoverableServerError {
        namespace: String,
        code: i32,
        message: String,
    },

    /// Any other server-side failure. Fatal.
    #[error("fatal server error on {namespace}: {message}")]
    FatalServerError { namespace: String, message: String },

    /// Cooperative shutdown via a cancellation token. Not reported as a
    /// failure to the caller beyond signalling that results are partial.
    #[error("operation cancelled")]
    CancellationError,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn format<S: Into<String>>(msg: S) -> Error {
        Error::FormatError(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Error {
        Error::ValidationError(msg.into())
    }

    /// Server error codes that §7 designates as ignorable unless
    /// `stop_on_error` is set.
    pub fn is_ignorable_code(code: i32) -> bool {
        matches!(code, 11000 | 121)
    }

    /// Whether this error should be swallowed (logged and skipped) under the
    /// default (non-stop-on-error) policy.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::IgnorableWriteError { .. })
    }
}

/// A server error code as reported in a command reply's `code` field, paired
/// with the sentinel "unacknowledged write" string the server may send in
/// lieu of a numeric code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    Coded(i32, String),
    Unacknowledged,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::Coded(code, msg) => write!(f, "[{}] {}", code, msg),
            WriteFailure::Unacknowledged => write!(f, "unacknowledged write"),
        }
    }
}

/// Classifies a raw write failure into the §7 taxonomy for a given namespace.
pub fn classify_write_failure(namespace: &str, failure: WriteFailure) -> Error {
    match failure {
        WriteFailure::Coded(code, message) if Error::is_ignorable_code(code) => {
            Error::IgnorableWriteError {
                namespace: namespace.to_owned(),
                code: Some(code),
                message,
            }
        }
        WriteFailure::Coded(408, message) => Error::RecoverableServerError {
            namespace: namespace.to_owned(),
            code: 408,
            message,
        },
        WriteFailure::Coded(code, message) => Error::FatalServerError {
            namespace: namespace.to_owned(),
            message: format!("[{}] {}", code, message),
        },
        WriteFailure::Unacknowledged => Error::IgnorableWriteError {
            namespace: namespace.to_owned(),
            code: None,
            message: "unacknowledged write".to_owned(),
        },
    }
}

//! Error and Result types.
use thiserror::Error;

/// A single constraint violation surfaced by a typed accessor or by `validate()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    /// Column name the issue applies to.
    pub column: String,
    /// Machine-readable violation code, e.g. `"too_big"`, `"out_of_range"`, `"invalid_format"`.
    pub code: &'static str,
    /// Human-readable detail.
    pub message: String,
}

impl ValidationIssue {
    pub fn new(column: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        ValidationIssue {
            column: column.into(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DatasetError {
    // Path-level I/O problems
    #[error("file not found: `{0}`")]
    FileNotFound(String),
    #[error("error reading file `{path}`: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Metadata format problems
    #[error("invalid file contents in `{path}`: {reason}")]
    InvalidFileContents { path: String, reason: String },
    #[error("schema validation failed for `{subject}`: {reason}")]
    SchemaValidation { subject: String, reason: String },

    // Programmer errors
    #[error("typed accessor `{accessor}` used on column `{column}` of type `{actual}`")]
    TypeMismatch {
        accessor: &'static str,
        column: String,
        actual: String,
    },

    // Row-level value/validation problems
    #[error("invalid value for column `{column}`: {reason}")]
    InvalidValue { column: String, reason: String },
    #[error("{0} validation issue(s)")]
    AggregateValidation(Vec<ValidationIssue>),

    // Working copy problems
    #[error("inconsistent working copy state: {0}")]
    InconsistentState(String),

    // Feature scope
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(String),
    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("GeoJSON error: {0}")]
    GeoJson(String),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

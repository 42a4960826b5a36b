use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("unknown axis '{axis}' in the {space} data space")]
    UnknownAxis { space: String, axis: String },

    #[error("invalid data space: {0}")]
    InvalidSpace(String),

    #[error("invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("frequency {frequency} cannot be represented by the hierarchy [{hierarchy}]: {reason}")]
    UnrepresentableFrequency {
        frequency: String,
        hierarchy: String,
        reason: String,
    },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid {kind} '{value}'")]
    InvalidValue { kind: String, value: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("failed to construct data tree: {0}")]
    DataTreeConstruction(String),

    #[error("ID clash between {frequency} rows with ID '{id}' (existing: {existing}; added: {added})")]
    DuplicateRow {
        frequency: String,
        id: String,
        existing: String,
        added: String,
    },

    #[error("no {frequency} row with ID '{id}'")]
    RowNotFound { frequency: String, id: String },

    #[error("'{0}' is not a column of the dataset")]
    UnknownColumn(String),

    #[error("column '{0}' already exists (use overwrite to replace it)")]
    ColumnNameClash(String),

    #[error("column '{column}' holds {expected} items and cannot be read from {row}")]
    WrongFrequency {
        column: String,
        expected: String,
        row: String,
    },

    #[error("column '{0}' is a source and cannot be written to")]
    NotASink(String),

    #[error("no items in {row} could be resolved to '{datatype}' for the '{column}' column (found: {})", .found.join(", "))]
    NoCandidates {
        column: String,
        row: String,
        datatype: String,
        found: Vec<String>,
    },

    #[error("did not find any items {criterion} in {row} for the '{column}' column (candidates: {})", .candidates.join(", "))]
    NoMatch {
        column: String,
        row: String,
        criterion: String,
        candidates: Vec<String>,
    },

    #[error("found {} matching items in {row} for the '{column}' column: {}", .matches.len(), .matches.join(", "))]
    AmbiguousMatch {
        column: String,
        row: String,
        matches: Vec<String>,
    },

    #[error("cannot select item {order} of {} matches in {row} for the '{column}' column (candidates: {})", .candidates.len(), .candidates.join(", "))]
    IndexOutOfRange {
        column: String,
        row: String,
        order: usize,
        candidates: Vec<String>,
    },

    #[error("timed out waiting for another process to download {uri} after {attempts} checks")]
    CacheTimeout { uri: String, attempts: u32 },

    #[error("checksums of {uri} differ from those reported by the remote")]
    ChecksumMismatch { uri: String },

    #[error("invalid provenance record: {0}")]
    InvalidProvenance(String),

    #[error("provenance format version {found} predates the minimum supported version {minimum}")]
    StaleFormat { found: String, minimum: String },

    #[error("unknown {kind} '{key}' (registered: {})", .known.join(", "))]
    UnknownRegistryKey {
        kind: String,
        key: String,
        known: Vec<String>,
    },

    #[error("no data stored for {0}")]
    MissingData(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("missing config file kira-ds.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("remote store error: {0}")]
    Remote(String),
}

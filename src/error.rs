//! Error types shared by the store and the export side.
//!
//! Only the variants of [`MergeError`] abort a unit's merge. Unresolvable
//! edges and sentinel facts are counted in the merge report instead.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("cannot lock `{}`: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open store `{}`: {source}", path.display())]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("cannot create schema: {0}")]
    SchemaCreation(#[source] rusqlite::Error),

    #[error("merge transaction failed: {0}")]
    Transaction(#[source] rusqlite::Error),
}

impl MergeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock { .. } => "lock_error",
            Self::StoreOpen { .. } => "store_open_error",
            Self::SchemaCreation(_) => "schema_error",
            Self::Transaction(_) => "transaction_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("cannot read store: {0}")]
    Read(#[from] rusqlite::Error),

    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot write snapshot: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Merge(err) => err.code(),
            Self::Read(_) => "sqlite_error",
            Self::Encode(_) => "json_error",
            Self::Io(_) => "write_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChangesError {
    #[error("cannot parse diff for `{path}`: {message}")]
    Patch { path: String, message: String },

    #[error(transparent)]
    Snapshot(#[from] ExportError),

    #[error("cannot read patch: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChangesError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Patch { .. } => "patch_error",
            Self::Snapshot(err) => err.code(),
            Self::Io(_) => "read_error",
            Self::Encode(_) => "json_error",
        }
    }
}

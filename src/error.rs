use std::path::PathBuf;

use crate::pipeline::Stage;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("dimension mismatch for {subject}: expected {expected}, found {found}")]
    DimensionMismatch {
        subject: String,
        expected: usize,
        found: usize,
    },

    #[error("failed to load index: {0}")]
    IndexLoad(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding request failed: {0}")]
    Embedding(String),

    #[error("relevance scoring failed: {0}")]
    Scoring(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("pipeline failed at stage {stage}: {source}")]
    Pipeline {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// The innermost error, looking through pipeline stage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error was caused by the caller's input rather than by
    /// the index or an external capability.
    ///
    /// Inside a pipeline run the query vector comes from the configured
    /// embedder, so a dimension mismatch there means the embedder and the
    /// index disagree and is not the caller's fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::Pipeline { source, .. } => {
                matches!(source.root(), Error::InvalidArgument(_))
            }
            Error::InvalidArgument(_) | Error::DimensionMismatch { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch() -> Error {
        Error::DimensionMismatch {
            subject: "query".to_string(),
            expected: 3,
            found: 2,
        }
    }

    #[test]
    fn bare_dimension_mismatch_is_a_client_error() {
        assert!(mismatch().is_client_error());
        assert!(Error::InvalidArgument("top_k".to_string()).is_client_error());
    }

    #[test]
    fn embedder_dimension_mismatch_is_a_server_error() {
        let err = Error::Pipeline {
            stage: Stage::Searched,
            source: Box::new(mismatch()),
        };
        assert!(!err.is_client_error());
    }

    #[test]
    fn wrapped_invalid_argument_stays_a_client_error() {
        let err = Error::Pipeline {
            stage: Stage::Searched,
            source: Box::new(Error::InvalidArgument("zero-norm query".to_string())),
        };
        assert!(err.is_client_error());
        assert!(!Error::Generation("boom".to_string()).is_client_error());
    }
}

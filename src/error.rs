use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("nothing to index: at least one chapter is required")]
    EmptyInput,

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("no index built for textbook '{0}'")]
    IndexNotFound(String),

    #[error("row {row_id} not found (store holds {len} rows)")]
    RowNotFound { row_id: usize, len: usize },

    #[error("index for textbook '{textbook_id}' is corrupt: {reason}")]
    CorruptIndex { textbook_id: String, reason: String },

    #[error("a rebuild of textbook '{0}' is already in progress")]
    RebuildInProgress(String),

    #[error("build of textbook '{0}' was aborted")]
    BuildAborted(String),

    #[error("top_k must be at least 1")]
    InvalidTopK,

    #[error("vector {row_id} contains a non-finite component")]
    InvalidVector { row_id: usize },

    #[error("invalid chapter at position {position}: {reason}")]
    InvalidChapter { position: usize, reason: String },

    #[error("invalid textbook id '{0}'")]
    InvalidTextbookId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether the textbook must be (re)indexed before it can be queried.
    pub fn needs_reindex(&self) -> bool {
        matches!(self, Error::IndexNotFound(_) | Error::CorruptIndex { .. })
    }
}

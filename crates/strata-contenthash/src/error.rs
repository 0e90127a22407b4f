pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the content-hash cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The requested path does not exist in the layer, even after a scan.
    ///
    /// Callers typically treat this as data rather than failure.
    #[error("{path}: not found")]
    NotFound { path: String },

    /// The symlink hop limit was exceeded while resolving a path.
    #[error("too many symlinks: {path}")]
    TooManySymlinks { path: String },

    /// A change notification arrived without the stat or digest metadata the
    /// journal requires.
    #[error("{path}: invalid change without stat information")]
    InvalidChange { path: String },

    /// The mount provider failed to surface the layer locally.
    #[error("failed to mount layer: {message}")]
    Mount { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("metadata store error: {message}")]
    Storage { message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// Whether this is the data-shaped "no such path" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

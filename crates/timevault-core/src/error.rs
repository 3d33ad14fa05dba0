use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Error kinds surfaced by the backup engine.
///
/// Propagation policy follows the session model: `Filesystem` and
/// `Integrity` are per-file (skipped and counted), `Catalog`, `Network`
/// and `Quota` are fatal to the session, `Busy` and `Cancelled` are clean
/// returns, and `NotFoundAtTime` is a user-visible answer rather than a
/// fault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("nothing found at the requested time: {0}")]
    NotFoundAtTime(String),

    #[error("another backup or restore session is already running")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Whether a session that hit this error left the catalog untouched.
    ///
    /// All fatal errors fire before the catalog commit, so the answer is
    /// yes for everything except `Catalog` itself, where the transaction
    /// rollback restores the previous state.
    pub fn is_per_file(&self) -> bool {
        matches!(self, VaultError::Filesystem(_) | VaultError::Integrity(_))
    }
}

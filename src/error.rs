use thiserror::Error;

/// Terminal failure states for a transfer session.
///
/// Session-level variants (`Network`, `CryptoAuthFailed`, `CryptoHandshake`,
/// `Protocol`) abort the session; the receiver's lock document survives for a
/// later resume. `Integrity` is only surfaced after the in-session retry
/// budget is exhausted.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("peer not authenticated: {0}")]
    Authentication(String),

    #[error("decryption failed: frame authentication tag did not verify")]
    CryptoAuthFailed,

    #[error("handshake failed: {0}")]
    CryptoHandshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("integrity check failed after retries for {files:?}")]
    Integrity { files: Vec<String> },

    #[error("unsafe path in manifest: {0}")]
    PathUnsafe(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),

    #[error("lock document corrupt: {0}")]
    LockCorruption(String),
}

impl TransferError {
    /// Wrap a socket-level I/O error.
    pub fn network(err: std::io::Error) -> Self {
        TransferError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

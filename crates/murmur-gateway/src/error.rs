use thiserror::Error;

use murmur_db::DbError;

/// Why a realtime connection stopped being served.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("archive write failed: {0}")]
    Archive(#[from] DbError),

    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("dispatcher is not running")]
    Closed,
}

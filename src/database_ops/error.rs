//! Error taxonomy for the location engine.
//!
//! Integrity problems are not errors: the verifier reports them as failing checks.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LocationError>;

#[derive(Error, Debug)]
pub enum LocationError {
    /// Database unreachable when a job starts.
    #[error("database unreachable: {0}")]
    Connection(#[source] sqlx::Error),

    /// A single dependent row's text or coordinate data cannot be processed.
    #[error("row {row_id} cannot be resolved: {reason}")]
    RowResolution { row_id: i64, reason: String },

    /// A canonical write collided with an existing `place_id`.
    #[error("place_id '{place_id}' already belongs to another location")]
    UpsertConflict { place_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown dependent table '{0}' (expected properties or developments)")]
    InvalidTable(String),
}

impl LocationError {
    /// Whether a batch job must stop instead of counting the failure against one row.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Migration(_) | Self::Io(_) | Self::InvalidTable(_) => true,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::RowResolution { .. } | Self::UpsertConflict { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_level_errors_are_recoverable() {
        let row = LocationError::RowResolution {
            row_id: 1,
            reason: "bad".into(),
        };
        assert!(!row.is_fatal());
        assert!(!LocationError::UpsertConflict {
            place_id: "ChIJ".into()
        }
        .is_fatal());
        assert!(!LocationError::Database(sqlx::Error::RowNotFound).is_fatal());
    }

    #[test]
    fn lost_connections_are_fatal() {
        assert!(LocationError::Database(sqlx::Error::PoolClosed).is_fatal());
        assert!(LocationError::Connection(sqlx::Error::PoolTimedOut).is_fatal());
    }
}

use crate::emergency::types::{Channel, EmergencyState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Version conflict on emergency {id} (expected version {expected})")]
    Conflict { id: String, expected: i64 },
    #[error("Emergency {0} not found in store")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Transient backend failures worth another attempt. Conflicts are
    /// resolved by the caller reloading, not by blind retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Database(_))
    }
}

impl From<sea_orm::DbErr> for PersistenceError {
    fn from(e: sea_orm::DbErr) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("No transport configured for channel {0}")]
    Unrouted(Channel),
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum EmergencyError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not authorized to {0}")]
    Unauthorized(&'static str),
    #[error("Emergency {0} not found")]
    NotFound(String),
    #[error("Emergency {id} is already {state}")]
    Closed { id: String, state: EmergencyState },
    #[error("Recipient {recipient_id} is not part of emergency {emergency_id}")]
    UnknownRecipient {
        emergency_id: String,
        recipient_id: String,
    },
    #[error("Rendering failed: {0}")]
    Render(#[from] crate::render::RenderError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_retry() {
        assert!(PersistenceError::Database("locked".into()).is_retryable());
        assert!(
            !PersistenceError::Conflict {
                id: "em-1".into(),
                expected: 3
            }
            .is_retryable()
        );
        assert!(!PersistenceError::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn db_err_maps_to_database() {
        let err: PersistenceError = sea_orm::DbErr::Custom("boom".into()).into();
        assert!(matches!(err, PersistenceError::Database(msg) if msg.contains("boom")));
    }
}

//! Persistence for emergencies.
//!
//! Everything is keyed by emergency id. Contexts use optimistic concurrency:
//! `save_context` only succeeds when the stored version equals the one the
//! caller loaded, and returns the bumped version.

pub mod database;
pub mod memory;

use crate::emergency::types::{
    Acknowledgment, EmergencyContext, QueuedEmergencyMessage, Recipient, RecipientDelivery,
};
use crate::error::PersistenceError;
use futures::future::BoxFuture;
use std::future::Future;
use time::OffsetDateTime;

pub use database::SeaOrmRepository;
pub use memory::InMemoryRepository;

pub type StoreResult<T> = Result<T, PersistenceError>;

pub trait EmergencyRepository: Send + Sync {
    fn insert_context<'a>(
        &'a self,
        ctx: &'a EmergencyContext,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Compare-and-swap on `ctx.version`. Returns the new version.
    fn save_context<'a>(&'a self, ctx: &'a EmergencyContext) -> BoxFuture<'a, StoreResult<i64>>;

    fn load_context<'a>(&'a self, id: &'a str)
    -> BoxFuture<'a, StoreResult<Option<EmergencyContext>>>;

    fn load_recipients<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Recipient>>>;

    /// Contexts not yet resolved or cancelled.
    fn list_active(&self) -> BoxFuture<'_, StoreResult<Vec<EmergencyContext>>>;

    fn upsert_delivery<'a>(&'a self, delivery: &'a RecipientDelivery)
    -> BoxFuture<'a, StoreResult<()>>;

    fn load_deliveries<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<RecipientDelivery>>>;

    /// Returns `false` when the recipient already acknowledged this emergency.
    fn insert_acknowledgment<'a>(&'a self, ack: &'a Acknowledgment)
    -> BoxFuture<'a, StoreResult<bool>>;

    fn load_acknowledgments<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Acknowledgment>>>;

    fn save_queued_message<'a>(
        &'a self,
        message: &'a QueuedEmergencyMessage,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn delete_queued_message<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    fn delete_queued_messages_for<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<u64>>;

    fn load_queued_messages<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<QueuedEmergencyMessage>>>;

    /// Delete archived emergencies (and everything keyed by them) archived before `cutoff`.
    fn purge_archived_before(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, StoreResult<u64>>;
}

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 50;

/// Run a store operation, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(operation: &'static str, mut f: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                tracing::warn!(
                    name = "store.retry",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Transient persistence failure, retrying",
                    operation = operation,
                    attempt = attempt,
                    backoff_ms = backoff,
                    error = %e,
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PersistenceError::Database("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Database("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Conflict {
                id: "em-1".into(),
                expected: 1,
            })
        })
        .await;
        assert!(matches!(result, Err(PersistenceError::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Evaluation task lifecycle management.
//!
//! Each active emergency gets one background task that periodically runs
//! escalation and resend evaluation. Tasks observe a stop flag and exit on
//! their next tick once it is cleared.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Future run as one emergency's evaluation loop.
pub type EvaluationTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Tracks the evaluation task of every active emergency by id.
///
/// The map holds each task's stop flag; removing an entry clears the flag so
/// the task winds down on its own without being aborted mid-evaluation.
pub struct EvaluationTaskManager {
    pub(crate) running: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl Default for EvaluationTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationTaskManager {
    /// Creates a manager with no tasks.
    pub fn new() -> Self {
        Self {
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Starts the task for an emergency, stopping any previous one first.
    #[tracing::instrument(skip(self, f))]
    pub async fn start_or_restart_task<F>(&self, emergency_id: &str, f: F)
    where
        F: FnOnce(Arc<AtomicBool>) -> EvaluationTask + Send + 'static,
    {
        let mut running = self.running.write().await;
        if let Some(flag) = running.get(emergency_id) {
            flag.store(false, Ordering::SeqCst);
        }
        let flag = Arc::new(AtomicBool::new(true));
        running.insert(emergency_id.to_string(), flag.clone());
        tokio::spawn(f(flag));
    }

    /// Whether an evaluation task is registered for this emergency.
    #[tracing::instrument(skip(self))]
    pub async fn is_running(&self, emergency_id: &str) -> bool {
        self.running.read().await.contains_key(emergency_id)
    }

    /// Ids of every emergency with a registered task, in no particular order.
    pub async fn running_ids(&self) -> Vec<String> {
        self.running.read().await.keys().cloned().collect()
    }

    /// Stops the task of one emergency. Does nothing when none is running.
    #[tracing::instrument(skip(self))]
    pub async fn stop_task(&self, emergency_id: &str) {
        if let Some(flag) = self.running.write().await.remove(emergency_id) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Stops every task, used on shutdown.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self) {
        let mut running = self.running.write().await;
        for flag in running.values() {
            flag.store(false, Ordering::SeqCst);
        }
        running.clear();
    }
}

//! Background loops driving active emergencies.
//!
//! - a supervisor that keeps one evaluation task per active emergency
//! - a dispatch loop that drains the priority queue
//! - a retention task that purges archived emergencies

use crate::config::{RetentionConfig, SchedulerConfig};
use crate::emergency::controller::EmergencyController;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use time::OffsetDateTime;
use tokio::time::Duration;

/// Keep evaluation tasks in step with the set of active emergencies.
#[tracing::instrument(skip_all)]
pub async fn supervise_evaluations(controller: Arc<EmergencyController>, config: SchedulerConfig) {
    let tick = Duration::from_secs(config.tick_interval_secs.max(1));
    loop {
        sync_evaluation_tasks(&controller, tick).await;
        tokio::time::sleep(tick).await;
    }
}

/// One supervisor round: start tasks for new emergencies, stop tasks for
/// emergencies that are no longer active.
pub async fn sync_evaluation_tasks(controller: &Arc<EmergencyController>, tick: Duration) {
    let tasks = controller.tasks().clone();
    let active: HashSet<String> = controller.active_ids().into_iter().collect();

    for id in tasks.running_ids().await {
        if !active.contains(&id) {
            tasks.stop_task(&id).await;
        }
    }

    for id in active {
        if tasks.is_running(&id).await {
            continue;
        }
        let controller = controller.clone();
        let emergency_id = id.clone();
        tasks
            .start_or_restart_task(&id, move |flag| {
                Box::pin(async move {
                    tracing::info!(
                        name = "emergency.evaluation.started",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        message = "Evaluation task started",
                        emergency_id = %emergency_id,
                    );
                    while flag.load(Ordering::SeqCst) {
                        match controller.evaluate(&emergency_id).await {
                            Ok(report) if report.state.is_none_or(|s| s.is_terminal()) => break,
                            Ok(_) => {}
                            Err(e) => tracing::error!(
                                name = "emergency.evaluation.failed",
                                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                                message = "Evaluation failed",
                                emergency_id = %emergency_id,
                                error = %e,
                            ),
                        }
                        tokio::time::sleep(tick).await;
                    }
                    tracing::info!(
                        name = "emergency.evaluation.stopped",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        message = "Evaluation task stopped",
                        emergency_id = %emergency_id,
                    );
                })
            })
            .await;
    }
}

/// Send queued messages as they become due.
#[tracing::instrument(skip_all)]
pub async fn dispatch_loop(controller: Arc<EmergencyController>, config: SchedulerConfig) {
    let idle = Duration::from_secs(config.dispatch_interval_secs.max(1));
    loop {
        let sent = controller.dispatch_ready().await;
        if sent > 0 {
            tracing::debug!(
                name = "emergency.dispatch.round",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Dispatch round finished",
                sent = sent,
                queued = controller.dispatcher().len(),
            );
            continue;
        }
        tokio::select! {
            _ = controller.dispatcher().woken() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

/// Periodically delete archived emergencies older than the retention window.
pub fn spawn_retention_task(controller: Arc<EmergencyController>, config: RetentionConfig) {
    let days = config.archive_retention_days;
    if days == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(12 * 60 * 60));
        loop {
            interval.tick().await;
            let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
            match controller.purge_archived_before(cutoff).await {
                Ok(purged) => tracing::info!(
                    name = "emergency.retention.pruned",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Pruned archived emergencies",
                    purged = purged,
                    retention_days = days,
                ),
                Err(e) => tracing::warn!(
                    name = "emergency.retention.failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Failed to prune archived emergencies",
                    error = %e,
                ),
            }
        }
    });
}

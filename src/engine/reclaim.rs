//! Reclaim service: takes stale claims back from idle sessions.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::clock::Clock;
use crate::config::ClaimConfig;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Status, Task};
use crate::store::{Guard, TaskPatch, TaskStore};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Returned to pending.
    pub reclaimed: usize,
    pub dead_lettered: usize,
    /// Finished, released or reclaimed by someone else between read and write.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    Requeued(Task),
    DeadLettered(Task),
    Skipped,
}

pub struct ReclaimService<S> {
    store: Arc<S>,
    events: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    config: ClaimConfig,
    shutdown: Arc<Notify>,
}

impl<S> Clone for ReclaimService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: TaskStore> ReclaimService<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the sweep loop to stop. A sweep in progress runs to completion.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Sweep every `sweep_interval` until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            timeout_secs = self.config.claim_timeout.as_secs(),
            "reclaim service started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reclaim service shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            match self.sweep_once().await {
                Ok(report) if report.examined > 0 => info!(?report, "reclaim sweep finished"),
                Ok(_) => debug!("reclaim sweep found no stale claims"),
                Err(e) => error!("reclaim sweep failed: {e}"),
            }
        }
    }

    /// Examine one batch of stale claims.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.claim_timeout)
            .map_err(|e| Error::Config(format!("claim timeout out of range: {e}")))?;
        let cutoff = now - timeout;

        let stale = self
            .store
            .stale_claims(cutoff, self.config.sweep_batch)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        for task in &stale {
            match self.reclaim(task, now).await {
                Ok(ReclaimOutcome::Requeued(_)) => report.reclaimed += 1,
                Ok(ReclaimOutcome::DeadLettered(_)) => report.dead_lettered += 1,
                Ok(ReclaimOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::reclaims().add(1, &[KeyValue::new("result", "error")]);
                    warn!(task_id = %task.id, "reclaim failed, skipping: {e}");
                }
            }
        }

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "reclaim.sweep")],
        );
        Ok(report)
    }

    /// Reclaim one stale claim as it was read. Skips if the claim changed.
    pub async fn reclaim(&self, task: &Task, now: DateTime<Utc>) -> Result<ReclaimOutcome> {
        let span = start_task_span("reclaim", Some(task.id));
        async {
            let retry_count = task.retry_count + 1;
            let dead = retry_count > self.config.max_retries;
            let destination = if dead {
                Status::DeadLetter
            } else {
                Status::Pending
            };

            let patch = TaskPatch::at(now)
                .status(destination)
                .clear_assignment()
                .bump_retry()
                .bump_timeout();
            let Some(updated) = self
                .store
                .conditional_update(task.id, &Guard::same_claim(task), &patch)
                .await?
            else {
                debug!("claim changed since it was read, skipping");
                metrics::reclaims().add(1, &[KeyValue::new("result", "skipped")]);
                return Ok(ReclaimOutcome::Skipped);
            };

            record_state_transition(&span, Status::InProgress, destination);
            metrics::reclaims().add(1, &[KeyValue::new("result", destination.as_str())]);
            self.events.broadcast(EventKind::Reclaimed {
                task_id: updated.id,
                retry_count: updated.retry_count,
                timeout_count: updated.timeout_count,
                dead_lettered: dead,
            });

            if dead {
                let e = Error::RetryBudgetExceeded {
                    task: updated.id,
                    retry_count: updated.retry_count,
                };
                warn!(max_retries = self.config.max_retries, "{e}, dead-lettered");
                Ok(ReclaimOutcome::DeadLettered(updated))
            } else {
                info!(
                    retry_count = updated.retry_count,
                    timeout_count = updated.timeout_count,
                    "stale claim returned to pool"
                );
                Ok(ReclaimOutcome::Requeued(updated))
            }
        }
        .instrument(span.clone())
        .await
    }
}

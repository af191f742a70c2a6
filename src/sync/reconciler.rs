//! Reconciliation of one group's stored membership with the upstream
//!
//! The full member list is fetched, diffed against the stored rows and the
//! difference applied in a single transaction. The job is then moved to a
//! terminal status.

use crate::database::Database;
use crate::error::JobError;
use crate::models::{Job, JobProgress, MembershipDiff};
use crate::otel::SyncMetrics;
use crate::upstream::{BatchedFetcher, GroupMembers};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal outcome of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Failed with the text stored in the job's info
    Failed(String),
}

/// Runs reconciliations for jobs of one credential
pub struct Reconciler {
    db: Arc<dyn Database>,
    fetcher: BatchedFetcher,
    members_per_page: u64,
    metrics: SyncMetrics,
}

impl Reconciler {
    pub fn new(
        db: Arc<dyn Database>,
        fetcher: BatchedFetcher,
        members_per_page: u64,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            db,
            fetcher,
            members_per_page,
            metrics,
        }
    }

    /// Reconcile the job's group and record the outcome in the ledger
    pub async fn run(&self, job: &Job) -> JobOutcome {
        let started = Instant::now();
        info!(
            job_id = %job.id,
            user_id = job.user_id,
            group_id = job.group_id,
            "Reconciling group"
        );

        let result = match self.reconcile(job).await {
            Ok(diff) => self
                .db
                .mark_succeeded(job.id, Utc::now())
                .await
                .map(|_| diff)
                .map_err(JobError::from),
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(diff) => {
                info!(
                    job_id = %job.id,
                    group_id = job.group_id,
                    joined = diff.joined.len(),
                    left = diff.left.len(),
                    "Group reconciled"
                );
                JobOutcome::Succeeded
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    job_id = %job.id,
                    group_id = job.group_id,
                    error = %message,
                    "Reconciliation failed"
                );
                if let Err(db_err) = self.db.mark_failed(job.id, &message, Utc::now()).await {
                    error!(job_id = %job.id, error = %db_err, "Failed to mark job failed");
                }
                JobOutcome::Failed(message)
            }
        };

        let label = match &outcome {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed(_) => "failed",
        };
        self.metrics
            .record_job_completed(label, started.elapsed().as_secs_f64());

        outcome
    }

    async fn reconcile(&self, job: &Job) -> Result<MembershipDiff, JobError> {
        let current = self.fetch_members(job).await?;
        let stored = self.db.list_group_members(job.group_id).await?;

        let diff = MembershipDiff::compute(&stored, &current);
        debug!(
            job_id = %job.id,
            stored = stored.len(),
            current = current.len(),
            joined = diff.joined.len(),
            left = diff.left.len(),
            "Computed membership diff"
        );

        if !diff.is_empty() {
            self.db.apply_membership_diff(job.group_id, &diff).await?;
            self.metrics
                .record_membership_changes(diff.joined.len(), diff.left.len());
        }
        self.db.stamp_group_updated(job.group_id, Utc::now()).await?;

        Ok(diff)
    }

    async fn fetch_members(&self, job: &Job) -> Result<Vec<i64>, JobError> {
        let collection = GroupMembers {
            group_id: job.group_id,
            page_size: self.members_per_page,
        };
        let mut cursor = self.fetcher.cursor(collection, None);
        let mut members = Vec::new();

        while let Some(batch) = cursor.next_batch().await? {
            members.extend(batch.items);

            let num_updated = cursor.offset();
            let progress = JobProgress {
                num_updated,
                num_total: batch.total.unwrap_or(num_updated).max(num_updated),
            };
            if let Err(e) = self.db.mark_running(job.id, Some(progress)).await {
                warn!(job_id = %job.id, error = %e, "Failed to record job progress");
            }
        }

        Ok(members)
    }
}

//! Update driver claiming jobs from the ledger and launching reconciliations
//!
//! Every poll interval the driver claims at most one runnable job per user,
//! moves Pending jobs to Running and spawns a detached reconciliation for
//! each of them. Launched jobs are never awaited by the driver.

use crate::config::{DriverConfig, RetryConfig, UpstreamConfig};
use crate::database::Database;
use crate::error::DbError;
use crate::models::{InvalidJob, JobStatus};
use crate::otel::SyncMetrics;
use crate::sync::reconciler::{JobOutcome, Reconciler};
use crate::upstream::{BatchedFetcher, RetryManager, UpstreamConnector};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one claim cycle did with the claimed jobs
#[derive(Debug, Default)]
pub struct DriveReport {
    /// Jobs moved to Running and handed to a reconciler
    pub launched: Vec<Uuid>,
    /// Jobs already Running
    pub skipped_running: Vec<Uuid>,
    /// Jobs left Pending because their owner has no credential
    pub missing_credentials: Vec<Uuid>,
    /// Jobs left Pending because the credential lookup or the Running write failed
    pub not_started: Vec<Uuid>,
    /// Claimed rows that break the job invariants
    pub invalid: Vec<InvalidJob>,
    /// Handles of the spawned reconciliations
    pub handles: Vec<JoinHandle<JobOutcome>>,
}

/// Update driver
pub struct UpdateDriver {
    db: Arc<dyn Database>,
    connector: Arc<dyn UpstreamConnector>,
    config: DriverConfig,
    retry: RetryConfig,
    upstream: UpstreamConfig,
    metrics: SyncMetrics,
    shutdown_rx: broadcast::Receiver<()>,
}

impl UpdateDriver {
    /// Create a new update driver
    ///
    /// # Arguments
    ///
    /// * `db` - Job ledger and membership store
    /// * `connector` - Builds an upstream client from a user's credential
    /// * `shutdown_rx` - Broadcast receiver for shutdown signal
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        connector: Arc<dyn UpstreamConnector>,
        config: DriverConfig,
        retry: RetryConfig,
        upstream: UpstreamConfig,
        metrics: SyncMetrics,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            db,
            connector,
            config,
            retry,
            upstream,
            metrics,
            shutdown_rx,
        }
    }

    /// Run claim cycles until the shutdown signal
    pub async fn run(mut self) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            claim_limit = self.config.claim_limit,
            "Starting update driver"
        );

        if !self.config.initial_delay().is_zero() {
            debug!(
                delay_secs = self.config.initial_delay_secs,
                "Waiting for initial delay"
            );
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping update driver");
                    return;
                }
                _ = tokio::time::sleep(self.config.initial_delay()) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping update driver");
                    break;
                }
                _ = ticker.tick() => {
                    match self.drive_once().await {
                        Ok(report) => {
                            if !report.launched.is_empty() {
                                info!(launched = report.launched.len(), "Launched jobs");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Claim cycle failed");
                        }
                    }
                }
            }
        }

        info!("Update driver stopped");
    }

    /// Run one claim cycle
    ///
    /// Only a failed claim is an error; per-job problems are logged and
    /// reported.
    pub async fn drive_once(&self) -> Result<DriveReport, DbError> {
        let claimed = self.db.claim_runnable_jobs(self.config.claim_limit).await?;
        let mut report = DriveReport::default();

        debug!(
            valid = claimed.valid.len(),
            invalid = claimed.invalid.len(),
            "Claimed jobs"
        );

        for invalid in &claimed.invalid {
            error!(
                job_id = %invalid.id,
                user_id = invalid.user_id,
                group_id = invalid.group_id,
                status = %invalid.status,
                reason = %invalid.reason,
                "Invalid job in ledger"
            );
            self.metrics.record_invalid_job();
        }
        report.invalid = claimed.invalid;

        for job in claimed.valid {
            if job.status == JobStatus::Running {
                debug!(job_id = %job.id, "Job already running");
                report.skipped_running.push(job.id);
                continue;
            }

            let token = match self.db.latest_access_token(job.user_id).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    error!(
                        job_id = %job.id,
                        user_id = job.user_id,
                        "No access token for job owner"
                    );
                    self.metrics.record_missing_credential();
                    report.missing_credentials.push(job.id);
                    continue;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        user_id = job.user_id,
                        error = %e,
                        "Failed to load access token"
                    );
                    report.not_started.push(job.id);
                    continue;
                }
            };

            if let Err(e) = self.db.mark_running(job.id, None).await {
                warn!(job_id = %job.id, error = %e, "Failed to mark job running");
                report.not_started.push(job.id);
                continue;
            }

            let reconciler = self.reconciler_for(&token.access_token);
            self.metrics.record_job_started();
            info!(
                job_id = %job.id,
                user_id = job.user_id,
                group_id = job.group_id,
                "Launching job"
            );

            report.launched.push(job.id);
            report
                .handles
                .push(tokio::spawn(async move { reconciler.run(&job).await }));
        }

        Ok(report)
    }

    fn reconciler_for(&self, access_token: &str) -> Reconciler {
        let retry = RetryManager::new(self.retry.clone()).with_metrics(self.metrics.clone());
        let fetcher = BatchedFetcher::new(
            self.connector.connect(access_token),
            retry,
            self.upstream.max_calls_per_request,
            self.metrics.clone(),
        );
        Reconciler::new(
            self.db.clone(),
            fetcher,
            self.upstream.members_per_page,
            self.metrics.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MockDatabase;
    use crate::error::UpstreamError;
    use crate::models::{AccessToken, ClaimedJobs, Job, JobInfo};
    use crate::upstream::{ApiCall, UpstreamApi};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Upstream where every group is empty
    struct EmptyUpstream;

    #[async_trait]
    impl UpstreamApi for EmptyUpstream {
        async fn call(&self, _call: &ApiCall) -> Result<Value, UpstreamError> {
            Ok(json!({"count": 0, "items": []}))
        }

        async fn execute(&self, calls: &[ApiCall]) -> Result<Vec<Value>, UpstreamError> {
            Ok(calls.iter().map(|_| json!({"count": 0, "items": []})).collect())
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        tokens: Mutex<Vec<String>>,
    }

    impl UpstreamConnector for RecordingConnector {
        fn connect(&self, access_token: &str) -> Arc<dyn UpstreamApi> {
            self.tokens.lock().unwrap().push(access_token.to_string());
            Arc::new(EmptyUpstream)
        }
    }

    fn job(user_id: i64, group_id: i64, info: JobInfo) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            user_id,
            group_id,
            status: info.status(),
            info,
            created_at: now,
            updated_at: now,
        }
    }

    fn token(user_id: i64, access_token: &str) -> AccessToken {
        AccessToken {
            id: 1,
            user_id,
            access_token: access_token.to_string(),
            created_at: Utc::now(),
        }
    }

    fn driver(
        db: MockDatabase,
        connector: Arc<RecordingConnector>,
    ) -> (UpdateDriver, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        let driver = UpdateDriver::new(
            Arc::new(db),
            connector,
            DriverConfig::default(),
            RetryConfig::default(),
            UpstreamConfig::default(),
            SyncMetrics::global(),
            rx,
        );
        (driver, tx)
    }

    /// Expectations for a reconciliation against an empty group
    fn expect_empty_reconciliation(db: &mut MockDatabase) {
        db.expect_list_group_members().returning(|_| Ok(vec![]));
        db.expect_stamp_group_updated().returning(|_, _| Ok(()));
        db.expect_mark_succeeded().returning(|_, _| Ok(()));
    }

    // Test 1: A Pending job with a credential is launched with that credential
    #[tokio::test]
    async fn test_pending_job_is_launched() {
        let pending = job(7, 42, JobInfo::Pending);
        let pending_id = pending.id;

        let mut db = MockDatabase::new();
        let claimed = ClaimedJobs {
            valid: vec![pending],
            invalid: vec![],
        };
        db.expect_claim_runnable_jobs()
            .withf(|limit| *limit == 5)
            .times(1)
            .return_once(move |_| Ok(claimed));
        db.expect_latest_access_token()
            .withf(|user_id| *user_id == 7)
            .returning(|user_id| Ok(Some(token(user_id, "token-7"))));
        db.expect_mark_running()
            .withf(move |id, progress| *id == pending_id && progress.is_none())
            .times(1)
            .returning(|_, _| Ok(()));
        expect_empty_reconciliation(&mut db);

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector.clone());

        let report = driver.drive_once().await.unwrap();
        assert_eq!(report.launched, vec![pending_id]);
        assert_eq!(*connector.tokens.lock().unwrap(), vec!["token-7".to_string()]);

        for handle in report.handles {
            assert_eq!(handle.await.unwrap(), JobOutcome::Succeeded);
        }
    }

    // Test 2: Running jobs are skipped
    #[tokio::test]
    async fn test_running_job_is_skipped() {
        let running = job(7, 42, JobInfo::Running { progress: None });
        let running_id = running.id;

        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs().return_once(move |_| {
            Ok(ClaimedJobs {
                valid: vec![running],
                invalid: vec![],
            })
        });
        db.expect_latest_access_token().never();
        db.expect_mark_running().never();

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector.clone());

        let report = driver.drive_once().await.unwrap();
        assert_eq!(report.skipped_running, vec![running_id]);
        assert!(report.launched.is_empty());
        assert!(connector.tokens.lock().unwrap().is_empty());
    }

    // Test 3: A job whose owner has no credential stays Pending
    #[tokio::test]
    async fn test_missing_credential_leaves_job_pending() {
        let pending = job(8, 42, JobInfo::Pending);
        let pending_id = pending.id;

        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs().return_once(move |_| {
            Ok(ClaimedJobs {
                valid: vec![pending],
                invalid: vec![],
            })
        });
        db.expect_latest_access_token().returning(|_| Ok(None));
        db.expect_mark_running().never();

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector);

        let report = driver.drive_once().await.unwrap();
        assert_eq!(report.missing_credentials, vec![pending_id]);
        assert!(report.handles.is_empty());
    }

    // Test 4: A failed Running write keeps the job from launching
    #[tokio::test]
    async fn test_mark_running_failure_does_not_launch() {
        let failing = job(7, 42, JobInfo::Pending);
        let failing_id = failing.id;
        let ok = job(9, 43, JobInfo::Pending);
        let ok_id = ok.id;

        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs().return_once(move |_| {
            Ok(ClaimedJobs {
                valid: vec![failing, ok],
                invalid: vec![],
            })
        });
        db.expect_latest_access_token()
            .returning(|user_id| Ok(Some(token(user_id, "token"))));
        db.expect_mark_running()
            .withf(move |id, _| *id == failing_id)
            .returning(|_, _| Err(DbError::NotFound));
        db.expect_mark_running()
            .withf(move |id, _| *id == ok_id)
            .returning(|_, _| Ok(()));
        expect_empty_reconciliation(&mut db);

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector);

        let report = driver.drive_once().await.unwrap();
        assert_eq!(report.not_started, vec![failing_id]);
        assert_eq!(report.launched, vec![ok_id]);

        for handle in report.handles {
            handle.await.unwrap();
        }
    }

    // Test 5: Invalid rows are reported and not launched
    #[tokio::test]
    async fn test_invalid_jobs_are_reported() {
        let invalid = InvalidJob {
            id: Uuid::new_v4().to_string(),
            user_id: 7,
            group_id: 42,
            status: "SUCCEEDED".to_string(),
            info: r#"{"type":"PENDING"}"#.to_string(),
            reason: "info type PENDING does not match status SUCCEEDED".to_string(),
        };

        let mut db = MockDatabase::new();
        let claimed = ClaimedJobs {
            valid: vec![],
            invalid: vec![invalid.clone()],
        };
        db.expect_claim_runnable_jobs().return_once(move |_| Ok(claimed));

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector);

        let report = driver.drive_once().await.unwrap();
        assert_eq!(report.invalid, vec![invalid]);
        assert!(report.launched.is_empty());
    }

    // Test 6: A failed claim is an error of the cycle
    #[tokio::test]
    async fn test_claim_failure_is_error() {
        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs()
            .returning(|_| Err(DbError::Migration("locked".to_string())));

        let connector = Arc::new(RecordingConnector::default());
        let (driver, _tx) = driver(db, connector);

        assert!(driver.drive_once().await.is_err());
    }

    // Test 7: The loop keeps polling after a failed cycle and stops on shutdown
    #[tokio::test(start_paused = true)]
    async fn test_run_continues_after_failure_until_shutdown() {
        let cycles = Arc::new(AtomicU32::new(0));
        let cycles_clone = cycles.clone();

        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs().returning(move |_| {
            if cycles_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DbError::Migration("locked".to_string()))
            } else {
                Ok(ClaimedJobs::default())
            }
        });

        let connector = Arc::new(RecordingConnector::default());
        let (driver, tx) = driver(db, connector);

        let handle = tokio::spawn(driver.run());
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        // Cycles at 0s, 5s and 10s
        assert_eq!(cycles.load(Ordering::SeqCst), 3);
    }

    // Test 8: Shutdown during the initial delay skips every cycle
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_initial_delay() {
        let mut db = MockDatabase::new();
        db.expect_claim_runnable_jobs().never();

        let (tx, rx) = broadcast::channel(1);
        let driver = UpdateDriver::new(
            Arc::new(db),
            Arc::new(RecordingConnector::default()),
            DriverConfig {
                initial_delay_secs: 60,
                ..DriverConfig::default()
            },
            RetryConfig::default(),
            UpstreamConfig::default(),
            SyncMetrics::global(),
            rx,
        );

        let handle = tokio::spawn(driver.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

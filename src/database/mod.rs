//! Database layer for member-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{AccessToken, ClaimedJobs, Job, JobProgress, MembershipDiff};

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the sync engine.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Job ledger operations
    // =========================================================================

    /// Insert one Pending job per group id, all in one transaction
    ///
    /// Returns the new job ids in the order of `group_ids`
    async fn insert_jobs(
        &self,
        request_id: Uuid,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<Vec<Uuid>, DbError>;

    /// Claim at most one runnable job per user, oldest first
    ///
    /// A runnable job is the oldest Pending or Running job of its user.
    /// Rows whose info disagrees with their status are returned separately.
    async fn claim_runnable_jobs(&self, limit: u32) -> Result<ClaimedJobs, DbError>;

    /// Set a job Running, optionally with progress
    async fn mark_running(&self, id: Uuid, progress: Option<JobProgress>) -> Result<(), DbError>;

    /// Set a job Succeeded
    async fn mark_succeeded(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<(), DbError>;

    /// Set a job Failed with an error message
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Get jobs by ids, skipping rows that break the job invariants
    async fn list_jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, DbError>;

    // =========================================================================
    // Membership operations
    // =========================================================================

    /// Get the stored member ids of a group, ascending
    async fn list_group_members(&self, group_id: i64) -> Result<Vec<i64>, DbError>;

    /// Delete `left` and insert `joined` members in one transaction
    async fn apply_membership_diff(
        &self,
        group_id: i64,
        diff: &MembershipDiff,
    ) -> Result<(), DbError>;

    // =========================================================================
    // Group operations
    // =========================================================================

    /// Record the time of the last successful reconciliation of a group
    async fn stamp_group_updated(&self, group_id: i64, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Get the time of the last successful reconciliation of a group
    async fn group_last_updated_at(&self, group_id: i64)
        -> Result<Option<DateTime<Utc>>, DbError>;

    // =========================================================================
    // Credential operations
    // =========================================================================

    /// Store an access token for a user
    ///
    /// Returns the ID of the inserted token
    async fn insert_access_token(&self, user_id: i64, access_token: &str) -> Result<i64, DbError>;

    /// Get the newest access token of a user
    async fn latest_access_token(&self, user_id: i64) -> Result<Option<AccessToken>, DbError>;
}

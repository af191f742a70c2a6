//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{
    AccessToken, ClaimedJobs, Job, JobInfo, JobProgress, JobRow, JobStatus, MembershipDiff,
};

const JOB_COLUMNS: &str =
    "id, request_id, user_id, group_id, status, info, created_at, updated_at";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }

    /// Overwrite status, info and updated_at of one job
    async fn set_job_info(&self, id: Uuid, info: JobInfo) -> Result<(), DbError> {
        let id = id.to_string();
        let status = info.status().to_string();
        let info = serde_json::to_string(&info)?;
        let now = format_datetime(&Utc::now());

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "UPDATE group_update_jobs SET status = ?1, info = ?2, updated_at = ?3 \
                     WHERE id = ?4",
                    rusqlite::params![status, info, now, id],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Job ledger operations
    // =========================================================================

    async fn insert_jobs(
        &self,
        request_id: Uuid,
        user_id: i64,
        group_ids: &[i64],
    ) -> Result<Vec<Uuid>, DbError> {
        let jobs: Vec<(Uuid, i64)> = group_ids.iter().map(|g| (Uuid::new_v4(), *g)).collect();
        let ids = jobs.iter().map(|(id, _)| *id).collect();
        let request_id = request_id.to_string();
        let status = JobStatus::Pending.to_string();
        let info = serde_json::to_string(&JobInfo::Pending)?;
        let now = format_datetime(&Utc::now());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO group_update_jobs
                        (id, request_id, user_id, group_id, status, info, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                        "#,
                    )?;
                    for (id, group_id) in &jobs {
                        stmt.execute(rusqlite::params![
                            id.to_string(),
                            request_id,
                            user_id,
                            group_id,
                            status,
                            info,
                            now
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(ids)
    }

    async fn claim_runnable_jobs(&self, limit: u32) -> Result<ClaimedJobs, DbError> {
        let rows = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let rows = {
                    let mut stmt = tx.prepare(
                        r#"
                        WITH ranked AS (
                            SELECT id, request_id, user_id, group_id, status, info,
                                   created_at, updated_at, rowid AS seq,
                                   ROW_NUMBER() OVER (
                                       PARTITION BY user_id ORDER BY created_at, rowid
                                   ) AS rn
                            FROM group_update_jobs
                            WHERE status IN ('PENDING', 'RUNNING')
                        )
                        SELECT id, request_id, user_id, group_id, status, info,
                               created_at, updated_at
                        FROM ranked
                        WHERE rn = 1
                        ORDER BY created_at, seq
                        LIMIT ?1
                        "#,
                    )?;

                    let rows = stmt
                        .query_map([limit], map_job_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                tx.commit()?;
                Ok(rows)
            })
            .await?;

        Ok(ClaimedJobs::from_rows(rows))
    }

    async fn mark_running(&self, id: Uuid, progress: Option<JobProgress>) -> Result<(), DbError> {
        self.set_job_info(id, JobInfo::Running { progress }).await
    }

    async fn mark_succeeded(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<(), DbError> {
        self.set_job_info(id, JobInfo::Succeeded { completed_at })
            .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let info = JobInfo::Failed {
            error: error.to_string(),
            completed_at,
        };
        self.set_job_info(id, info).await
    }

    async fn list_jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();

        let rows = self
            .conn
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT {} FROM group_update_jobs WHERE id IN ({}) ORDER BY created_at, rowid",
                    JOB_COLUMNS, placeholders
                );
                let mut stmt = conn.prepare(&sql)?;

                let rows = stmt
                    .query_map(rusqlite::params_from_iter(ids.iter()), map_job_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(rows)
            })
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match Job::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(invalid) => {
                    tracing::warn!(
                        job_id = %invalid.id,
                        status = %invalid.status,
                        reason = %invalid.reason,
                        "Skipping invalid job"
                    );
                }
            }
        }

        Ok(jobs)
    }

    // =========================================================================
    // Membership operations
    // =========================================================================

    async fn list_group_members(&self, group_id: i64) -> Result<Vec<i64>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id",
                )?;

                let members = stmt
                    .query_map([group_id], |row| row.get(0))?
                    .collect::<Result<Vec<i64>, _>>()?;

                Ok(members)
            })
            .await
            .map_err(Into::into)
    }

    async fn apply_membership_diff(
        &self,
        group_id: i64,
        diff: &MembershipDiff,
    ) -> Result<(), DbError> {
        let left = diff.left.clone();
        let joined = diff.joined.clone();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut delete = tx.prepare(
                        "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    )?;
                    for user_id in &left {
                        delete.execute(rusqlite::params![group_id, user_id])?;
                    }

                    // DO NOTHING covers the unique pair only, a bad id still aborts
                    let mut insert = tx.prepare(
                        r#"
                        INSERT INTO group_members (group_id, user_id)
                        VALUES (?1, ?2)
                        ON CONFLICT(group_id, user_id) DO NOTHING
                        "#,
                    )?;
                    for user_id in &joined {
                        insert.execute(rusqlite::params![group_id, user_id])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    // =========================================================================
    // Group operations
    // =========================================================================

    async fn stamp_group_updated(&self, group_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let at = format_datetime(&at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO groups (id, last_updated_at)
                    VALUES (?1, ?2)
                    ON CONFLICT(id) DO UPDATE SET last_updated_at = excluded.last_updated_at
                    "#,
                    rusqlite::params![group_id, at],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn group_last_updated_at(
        &self,
        group_id: i64,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let stamp = self
            .conn
            .call(move |conn| {
                let stamp = conn
                    .query_row(
                        "SELECT last_updated_at FROM groups WHERE id = ?1",
                        [group_id],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?;
                Ok(stamp.flatten())
            })
            .await?;

        Ok(parse_datetime(stamp))
    }

    // =========================================================================
    // Credential operations
    // =========================================================================

    async fn insert_access_token(&self, user_id: i64, access_token: &str) -> Result<i64, DbError> {
        let access_token = access_token.to_string();
        let created_at = format_datetime(&Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO oauth_tokens (user_id, access_token, created_at) \
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![user_id, access_token, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    async fn latest_access_token(&self, user_id: i64) -> Result<Option<AccessToken>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, user_id, access_token, created_at
                    FROM oauth_tokens
                    WHERE user_id = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#,
                )?;

                let result = stmt
                    .query_row([user_id], |row| {
                        Ok(AccessToken {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            access_token: row.get(2)?,
                            created_at: parse_datetime(row.get::<_, Option<String>>(3)?)
                                .unwrap_or_else(Utc::now),
                        })
                    })
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }
}

/// Map a `group_update_jobs` row selected with `JOB_COLUMNS` order
fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        request_id: row.get(1)?,
        user_id: row.get(2)?,
        group_id: row.get(3)?,
        status: row.get(4)?,
        info: row.get(5)?,
        created_at: parse_datetime(row.get::<_, Option<String>>(6)?).unwrap_or_else(Utc::now),
        updated_at: parse_datetime(row.get::<_, Option<String>>(7)?).unwrap_or_else(Utc::now),
    })
}

/// Fixed-width RFC3339 so that text order matches time order
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

//! Job-related domain models
//!
//! A job asks for one group's membership to be resynchronized on behalf of a
//! user. Its `info` column is a status-tagged payload; the tag must always
//! agree with the `status` column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by the driver and being reconciled
    Running,
    /// Withdrawn before completion
    Cancelled,
    /// Reconciliation finished
    Succeeded,
    /// Reconciliation aborted with an error
    Failed,
}

impl JobStatus {
    /// Column value used in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Progress of a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Members fetched so far
    pub num_updated: u64,
    /// Member count reported by the upstream
    pub num_total: u64,
}

/// Status-specific payload stored in the `info` column
///
/// Serialized with a `type` discriminator holding the status name, e.g.
/// `{"type":"RUNNING","progress":{"num_updated":25000,"num_total":81234}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum JobInfo {
    Pending,
    Running {
        #[serde(default)]
        progress: Option<JobProgress>,
    },
    Cancelled,
    Succeeded {
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

impl JobInfo {
    /// Status this payload belongs to
    pub fn status(&self) -> JobStatus {
        match self {
            JobInfo::Pending => JobStatus::Pending,
            JobInfo::Running { .. } => JobStatus::Running,
            JobInfo::Cancelled => JobStatus::Cancelled,
            JobInfo::Succeeded { .. } => JobStatus::Succeeded,
            JobInfo::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// A synchronization job as stored in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub request_id: Uuid,
    /// User whose credential is used for the upstream calls
    pub user_id: i64,
    pub group_id: i64,
    pub status: JobStatus,
    pub info: JobInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw ledger row before the status/info agreement check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub request_id: String,
    pub user_id: i64,
    pub group_id: i64,
    pub status: String,
    pub info: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A ledger row that breaks the job invariants
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidJob {
    pub id: String,
    pub user_id: i64,
    pub group_id: i64,
    pub status: String,
    pub info: String,
    /// What is wrong with the row
    pub reason: String,
}

impl TryFrom<JobRow> for Job {
    type Error = InvalidJob;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let invalid = |row: &JobRow, reason: String| InvalidJob {
            id: row.id.clone(),
            user_id: row.user_id,
            group_id: row.group_id,
            status: row.status.clone(),
            info: row.info.clone(),
            reason,
        };

        let id = Uuid::parse_str(&row.id).map_err(|e| invalid(&row, format!("bad id: {}", e)))?;
        let request_id = Uuid::parse_str(&row.request_id)
            .map_err(|e| invalid(&row, format!("bad request id: {}", e)))?;
        let status: JobStatus = row.status.parse().map_err(|e| invalid(&row, e))?;
        let info: JobInfo = serde_json::from_str(&row.info)
            .map_err(|e| invalid(&row, format!("bad info: {}", e)))?;

        if info.status() != status {
            return Err(invalid(
                &row,
                format!("info type {} does not match status {}", info.status(), status),
            ));
        }

        Ok(Job {
            id,
            request_id,
            user_id: row.user_id,
            group_id: row.group_id,
            status,
            info,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Result of one claim: at most one job per user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimedJobs {
    /// Jobs that may be advanced
    pub valid: Vec<Job>,
    /// Rows excluded because they break the invariants
    pub invalid: Vec<InvalidJob>,
}

impl ClaimedJobs {
    /// Split raw rows into valid and invalid jobs, keeping row order
    pub fn from_rows(rows: Vec<JobRow>) -> Self {
        let mut claimed = ClaimedJobs::default();
        for row in rows {
            match Job::try_from(row) {
                Ok(job) => claimed.valid.push(job),
                Err(invalid) => claimed.invalid.push(invalid),
            }
        }
        claimed
    }
}

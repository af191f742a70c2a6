//! Domain models for member-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod credential;
pub mod job;
pub mod membership;
pub mod user;

// Re-export commonly used types
pub use credential::AccessToken;
pub use job::{ClaimedJobs, InvalidJob, Job, JobInfo, JobProgress, JobRow, JobStatus};
pub use membership::MembershipDiff;
pub use user::{UserProfile, DEFAULT_PROFILE_FIELDS};

//! Record types for the `sites` and `jobs` tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use webfleet_core::SiteStatus;

/// Kind of orchestration work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Provision,
    Destroy,
    StaticProvision,
}

impl JobKind {
    /// String form as persisted and exposed over the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "PROVISION",
            Self::Destroy => "DESTROY",
            Self::StaticProvision => "STATIC_PROVISION",
        }
    }

    /// Site status a completed job of this kind leaves behind.
    #[must_use]
    pub const fn completed_site_status(self) -> SiteStatus {
        match self {
            Self::Provision | Self::StaticProvision => SiteStatus::Active,
            Self::Destroy => SiteStatus::Destroyed,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISION" => Ok(Self::Provision),
            "DESTROY" => Ok(Self::Destroy),
            "STATIC_PROVISION" => Ok(Self::StaticProvision),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Queue status of a job.
///
/// Jobs advance `PENDING → PROCESSING → {COMPLETED, FAILED, PENDING}`;
/// the loop back to `PENDING` is a retry and does not reset `attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// String form as persisted and exposed over the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the job is still in flight (pending or processing).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One row of the `sites` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    /// Site identifier (`^[a-z0-9]+$`), primary key.
    pub site: String,
    /// Default domain, `<site>.<base>`.
    pub domain: String,
    /// Custom domain, unique across non-destroyed sites when set.
    pub custom_domain: Option<String>,
    /// Current lifecycle status.
    pub status: SiteStatus,
    /// Identifier of the most recently enqueued job for this site.
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SiteRecord {
    /// The hostname traffic is currently served under: the custom domain
    /// when one is attached, the default domain otherwise.
    #[must_use]
    pub fn active_domain(&self) -> &str {
        self.custom_domain.as_deref().unwrap_or(&self.domain)
    }
}

/// One row of the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque job identifier, primary key.
    pub id: String,
    pub kind: JobKind,
    /// Site this job operates on.
    pub site: String,
    pub status: JobStatus,
    /// Number of claims so far; monotonically non-decreasing.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Last recorded error, if any.
    pub error: Option<String>,
    /// Optional work payload (e.g. staging path of an uploaded archive).
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_round_trip() {
        for kind in [JobKind::Provision, JobKind::Destroy, JobKind::StaticProvision] {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
    }

    #[test]
    fn completed_status_by_kind() {
        assert_eq!(
            JobKind::Provision.completed_site_status(),
            SiteStatus::Active
        );
        assert_eq!(
            JobKind::StaticProvision.completed_site_status(),
            SiteStatus::Active
        );
        assert_eq!(
            JobKind::Destroy.completed_site_status(),
            SiteStatus::Destroyed
        );
    }

    #[test]
    fn active_statuses() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Failed.is_active());
    }
}

//! MariaDB state store implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;

use webfleet_core::SiteStatus;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::{JobKind, JobRecord, JobStatus, SiteRecord};

/// Marker recorded on jobs rescued by startup recovery.
const RECOVERY_MARKER: &str = "recovered: was stuck in PROCESSING";

/// MariaDB-backed state store.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Connect to MariaDB and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(dsn: &str) -> StateResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: MySqlPool) -> StateResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> StateResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                site          VARCHAR(63)  NOT NULL PRIMARY KEY,
                domain        VARCHAR(253) NOT NULL,
                custom_domain VARCHAR(253) NULL,
                status        VARCHAR(32)  NOT NULL,
                job_id        VARCHAR(36)  NOT NULL DEFAULT '',
                created_at    DATETIME(6)  NOT NULL,
                updated_at    DATETIME(6)  NOT NULL,
                UNIQUE KEY uniq_sites_custom_domain (custom_domain)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id           VARCHAR(36)  NOT NULL PRIMARY KEY,
                kind         VARCHAR(32)  NOT NULL,
                site         VARCHAR(63)  NOT NULL,
                status       VARCHAR(16)  NOT NULL,
                attempts     INT UNSIGNED NOT NULL DEFAULT 0,
                max_attempts INT UNSIGNED NOT NULL DEFAULT 3,
                error        TEXT         NULL,
                payload      TEXT         NULL,
                created_at   DATETIME(6)  NOT NULL,
                updated_at   DATETIME(6)  NOT NULL,
                started_at   DATETIME(6)  NULL,
                completed_at DATETIME(6)  NULL,
                KEY idx_jobs_site_status (site, status),
                KEY idx_jobs_status_created (status, created_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn site_from_row(row: &MySqlRow) -> StateResult<SiteRecord> {
        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse::<SiteStatus>()
            .map_err(|e| StateError::Corrupt(e.to_string()))?;

        Ok(SiteRecord {
            site: row.try_get("site")?,
            domain: row.try_get("domain")?,
            custom_domain: row.try_get("custom_domain")?,
            status,
            job_id: row.try_get("job_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn job_from_row(row: &MySqlRow) -> StateResult<JobRecord> {
        let kind_str: String = row.try_get("kind")?;
        let status_str: String = row.try_get("status")?;

        Ok(JobRecord {
            id: row.try_get("id")?,
            kind: kind_str.parse().map_err(StateError::Corrupt)?,
            site: row.try_get("site")?,
            status: status_str.parse().map_err(StateError::Corrupt)?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error: row.try_get("error")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

const SITE_COLUMNS: &str = "site, domain, custom_domain, status, job_id, created_at, updated_at";
const JOB_COLUMNS: &str = "id, kind, site, status, attempts, max_attempts, error, payload, \
                           created_at, updated_at, started_at, completed_at";

#[async_trait]
impl StateStore for MySqlStore {
    async fn insert_job(&self, id: &str, kind: JobKind, site: &str) -> StateResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, site, status, attempts, max_attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'PENDING', 0, 3, ?, ?)
            "#,
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(site)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_job_payload(&self, id: &str, payload: &str) -> StateResult<()> {
        let result = sqlx::query("UPDATE jobs SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(payload)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::JobNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn upsert_site(
        &self,
        site: &str,
        domain: &str,
        status: SiteStatus,
        job_id: &str,
    ) -> StateResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM sites WHERE site = ? FOR UPDATE")
                .bind(site)
                .fetch_optional(&mut *tx)
                .await?;

        match current {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sites (site, domain, status, job_id, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(site)
                .bind(domain)
                .bind(status.as_str())
                .bind(job_id)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            Some(current) => {
                let current = current
                    .parse::<SiteStatus>()
                    .map_err(|e| StateError::Corrupt(e.to_string()))?;

                if current != status && !current.can_transition_to(status) {
                    return Err(StateError::InvalidTransition {
                        from: current,
                        to: status,
                    });
                }

                sqlx::query(
                    r#"
                    UPDATE sites
                    SET domain = ?, status = ?, job_id = ?, updated_at = ?
                    WHERE site = ?
                    "#,
                )
                .bind(domain)
                .bind(status.as_str())
                .bind(job_id)
                .bind(now)
                .bind(site)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn transition_site(&self, site: &str, target: SiteStatus) -> StateResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM sites WHERE site = ? FOR UPDATE")
                .bind(site)
                .fetch_optional(&mut *tx)
                .await?;

        let current = current
            .ok_or_else(|| StateError::SiteNotFound(site.to_owned()))?
            .parse::<SiteStatus>()
            .map_err(|e| StateError::Corrupt(e.to_string()))?;

        if !current.can_transition_to(target) {
            return Err(StateError::InvalidTransition {
                from: current,
                to: target,
            });
        }

        sqlx::query("UPDATE sites SET status = ?, updated_at = ? WHERE site = ?")
            .bind(target.as_str())
            .bind(Utc::now())
            .bind(site)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_next_job(&self) -> StateResult<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'PENDING' AND attempts < max_attempts
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut job = Self::job_from_row(&row)?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PROCESSING', attempts = attempts + 1, started_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;

        Ok(Some(job))
    }

    async fn complete_job(&self, id: &str, site: &str, kind: JobKind) -> StateResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', error = NULL, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::JobNotFound(id.to_owned()));
        }

        self.transition_site(site, kind.completed_site_status())
            .await
    }

    async fn fail_job(&self, id: &str, _site: &str, error: &str) -> StateResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'FAILED', error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::JobNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn retry_job(&self, id: &str, error: &str) -> StateResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'PENDING', error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(format!("attempt failed: {error}"))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::JobNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn recover_stuck_jobs(&self, timeout: Duration) -> StateResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout)
                .map_err(|e| StateError::Corrupt(format!("stuck-job timeout out of range: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING', error = ?, updated_at = ?
            WHERE status = 'PROCESSING' AND started_at < ?
            "#,
        )
        .bind(RECOVERY_MARKER)
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn has_active_job(&self, site: &str) -> StateResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE site = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(site)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn ensure_domain_available(&self, domain: &str, site: &str) -> StateResult<()> {
        let holder: Option<String> = sqlx::query_scalar(
            r#"
            SELECT site FROM sites
            WHERE custom_domain = ? AND site <> ? AND status <> 'DESTROYED'
            LIMIT 1
            "#,
        )
        .bind(domain)
        .bind(site)
        .fetch_optional(&self.pool)
        .await?;

        match holder {
            Some(held_by) => Err(StateError::DomainTaken {
                domain: domain.to_owned(),
                held_by,
            }),
            None => Ok(()),
        }
    }

    async fn set_custom_domain(&self, site: &str, domain: Option<&str>) -> StateResult<()> {
        let result = sqlx::query("UPDATE sites SET custom_domain = ?, updated_at = ? WHERE site = ?")
            .bind(domain)
            .bind(Utc::now())
            .bind(site)
            .execute(&self.pool)
            .await
            .map_err(|e| match (&e, domain) {
                // The unique index is the storage-level backstop for
                // cross-site domain uniqueness.
                (sqlx::Error::Database(db), Some(d)) if db.is_unique_violation() => {
                    StateError::DomainTaken {
                        domain: d.to_owned(),
                        held_by: "another site".to_owned(),
                    }
                }
                _ => StateError::Database(e),
            })?;

        if result.rows_affected() == 0 {
            return Err(StateError::SiteNotFound(site.to_owned()));
        }
        Ok(())
    }

    async fn get_site(&self, site: &str) -> StateResult<Option<SiteRecord>> {
        let row = sqlx::query(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE site = ?"))
            .bind(site)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(Self::site_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_sites(&self) -> StateResult<Vec<SiteRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::site_from_row).collect()
    }

    async fn get_job(&self, id: &str) -> StateResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(Self::job_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn hard_delete_site(&self, site: &str) -> StateResult<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM sites WHERE site = ? FOR UPDATE")
                .bind(site)
                .fetch_optional(&mut *tx)
                .await?;

        let status = status
            .ok_or_else(|| StateError::SiteNotFound(site.to_owned()))?
            .parse::<SiteStatus>()
            .map_err(|e| StateError::Corrupt(e.to_string()))?;

        if status != SiteStatus::Destroyed {
            return Err(StateError::conflict(
                "site must be DESTROYED before hard delete",
            ));
        }

        sqlx::query("DELETE FROM jobs WHERE site = ?")
            .bind(site)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sites WHERE site = ?")
            .bind(site)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn hard_delete_job(&self, id: &str) -> StateResult<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ? FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = status
            .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?
            .parse::<JobStatus>()
            .map_err(StateError::Corrupt)?;

        if status.is_active() {
            return Err(StateError::conflict("cannot delete active job"));
        }

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for MySqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlStore").finish_non_exhaustive()
    }
}

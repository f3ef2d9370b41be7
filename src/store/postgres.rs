//! Postgres-backed job store.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{ErrorKind, Job, JobError, JobStatus, NewJob, OutputFormat, Tier};

const JOB_COLUMNS: &str = "id, owner_id, tier, status, attempt_count, payload_ref, \
     output_format, result_ref, error_kind, error_message, cancel_requested, \
     created_at, started_at, finished_at, version";

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
        let status: String = row.try_get("status")?;
        let tier: String = row.try_get("tier")?;
        let output_format: String = row.try_get("output_format")?;
        let error_kind: Option<String> = row.try_get("error_kind")?;
        let error_message: Option<String> = row.try_get("error_message")?;

        let error = match (error_kind, error_message) {
            (Some(kind), Some(message)) => Some(JobError {
                kind: ErrorKind::from_str(&kind)
                    .map_err(|_| StoreError::Decode(format!("unknown error kind {kind}")))?,
                message,
            }),
            _ => None,
        };

        Ok(Job {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            tier: Tier::from_str(&tier)
                .map_err(|_| StoreError::Decode(format!("unknown tier {tier}")))?,
            status: JobStatus::from_str(&status)
                .map_err(|_| StoreError::Decode(format!("unknown status {status}")))?,
            attempt_count: row.try_get("attempt_count")?,
            payload_ref: row.try_get("payload_ref")?,
            output_format: OutputFormat::from_str(&output_format)
                .map_err(|_| StoreError::Decode(format!("unknown format {output_format}")))?,
            result_ref: row.try_get("result_ref")?,
            error,
            cancel_requested: row.try_get("cancel_requested")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            version: row.try_get("version")?,
        })
    }

    /// A guarded UPDATE that matched no rows is either a race loss or a
    /// dangling id; re-read to tell them apart.
    async fn conflict_or_missing(&self, id: Uuid) -> StoreError {
        match self.get(id).await {
            Ok(Some(_)) => StoreError::Conflict,
            Ok(None) => StoreError::NotFound,
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: NewJob, quota_ceiling: i32) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Atomic increment-with-ceiling: the conditional upsert returns no
        // row once the owner is saturated.
        let reserved = sqlx::query(
            r#"
            INSERT INTO owner_quota (owner_id, in_flight)
            VALUES ($1, 1)
            ON CONFLICT (owner_id) DO UPDATE
                SET in_flight = owner_quota.in_flight + 1
                WHERE owner_quota.in_flight < $2
            RETURNING in_flight
            "#,
        )
        .bind(&job.owner_id)
        .bind(quota_ceiling)
        .fetch_optional(&mut *tx)
        .await?;

        if reserved.is_none() {
            tx.rollback().await?;
            return Err(StoreError::QuotaExceeded {
                owner_id: job.owner_id,
                ceiling: quota_ceiling,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO render_jobs (id, owner_id, tier, status, payload_ref, output_format)
            VALUES ($1, $2, $3, 'queued', $4, $5)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(job.id)
        .bind(&job.owner_id)
        .bind(job.tier.to_string())
        .bind(&job.payload_ref)
        .bind(job.output_format.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let job = Self::job_from_row(&row)?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn mark_running(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET status = 'running',
                attempt_count = attempt_count + 1,
                started_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::job_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        version: i64,
        result_ref: &str,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET status = 'succeeded',
                result_ref = $3,
                finished_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(version)
        .bind(result_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.conflict_or_missing(id).await);
        };

        let job = Self::job_from_row(&row)?;
        release_quota(&mut tx, &job.owner_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        version: i64,
        error: &JobError,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET status = 'failed',
                error_kind = $3,
                error_message = $4,
                finished_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(version)
        .bind(error.kind.to_string())
        .bind(&error.message)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.conflict_or_missing(id).await);
        };

        let job = Self::job_from_row(&row)?;
        release_quota(&mut tx, &job.owner_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn mark_cancelled(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET status = 'cancelled',
                finished_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.conflict_or_missing(id).await);
        };

        let job = Self::job_from_row(&row)?;
        release_quota(&mut tx, &job.owner_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn requeue(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET status = 'queued',
                started_at = NULL,
                version = version + 1
            WHERE id = $1 AND version = $2 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::job_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE render_jobs
            SET cancel_requested = TRUE
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn running_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM render_jobs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn release_quota(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    owner_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE owner_quota SET in_flight = GREATEST(in_flight - 1, 0) WHERE owner_id = $1",
    )
    .bind(owner_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

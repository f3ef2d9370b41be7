//! In-memory job store for single-process deployments and tests.
//!
//! Same transition guards as the Postgres store, with a mutex standing in
//! for row-level atomicity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{Job, JobError, JobStatus, NewJob};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    in_flight: HashMap<String, i32>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of job records ever created.
    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }
}

impl Inner {
    fn guarded_mut(
        &mut self,
        id: Uuid,
        version: i64,
        from: &[JobStatus],
    ) -> Result<&mut Job, StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.version != version || !from.contains(&job.status) {
            return Err(StoreError::Conflict);
        }
        Ok(job)
    }

    fn release_quota(&mut self, owner_id: &str) {
        if let Some(n) = self.in_flight.get_mut(owner_id) {
            *n = (*n - 1).max(0);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob, quota_ceiling: i32) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;

        let count = inner.in_flight.entry(job.owner_id.clone()).or_insert(0);
        if *count >= quota_ceiling {
            return Err(StoreError::QuotaExceeded {
                owner_id: job.owner_id,
                ceiling: quota_ceiling,
            });
        }
        *count += 1;

        let record = Job {
            id: job.id,
            owner_id: job.owner_id,
            tier: job.tier,
            status: JobStatus::Queued,
            attempt_count: 0,
            payload_ref: job.payload_ref,
            output_format: job.output_format,
            result_ref: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        };
        inner.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.guarded_mut(id, version, &[JobStatus::Queued])?;
        job.status = JobStatus::Running;
        job.attempt_count += 1;
        job.started_at = Some(Utc::now());
        job.version += 1;
        Ok(job.clone())
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        version: i64,
        result_ref: &str,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.guarded_mut(id, version, &[JobStatus::Running])?;
        job.status = JobStatus::Succeeded;
        job.result_ref = Some(result_ref.to_string());
        job.finished_at = Some(Utc::now());
        job.version += 1;
        let done = job.clone();
        inner.release_quota(&done.owner_id);
        Ok(done)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        version: i64,
        error: &JobError,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.guarded_mut(id, version, &[JobStatus::Queued, JobStatus::Running])?;
        job.status = JobStatus::Failed;
        job.error = Some(error.clone());
        job.finished_at = Some(Utc::now());
        job.version += 1;
        let done = job.clone();
        inner.release_quota(&done.owner_id);
        Ok(done)
    }

    async fn mark_cancelled(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.guarded_mut(id, version, &[JobStatus::Queued, JobStatus::Running])?;
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        job.version += 1;
        let done = job.clone();
        inner.release_quota(&done.owner_id);
        Ok(done)
    }

    async fn requeue(&self, id: Uuid, version: i64) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.guarded_mut(id, version, &[JobStatus::Running])?;
        job.status = JobStatus::Queued;
        job.started_at = None;
        job.version += 1;
        Ok(job.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.cancel_requested = true;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn running_count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{ErrorKind, OutputFormat, Tier};

    fn new_job(owner: &str) -> NewJob {
        NewJob {
            id: Uuid::new_v4(),
            owner_id: owner.to_string(),
            tier: Tier::Free,
            payload_ref: "store://cvs/123".to_string(),
            output_format: OutputFormat::Pdf,
        }
    }

    #[tokio::test]
    async fn transition_with_stale_version_conflicts() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job("o1"), 5).await.unwrap();

        let claimed = store.mark_running(job.id, job.version).await.unwrap();
        assert_eq!(claimed.attempt_count, 1);

        // Second claim against the original version loses the race.
        let err = store.mark_running(job.id, job.version).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn result_ref_only_reachable_through_success() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job("o1"), 5).await.unwrap();
        let running = store.mark_running(job.id, job.version).await.unwrap();
        let failed = store
            .mark_failed(
                running.id,
                running.version,
                &JobError::new(ErrorKind::RenderFailed, "bad input"),
            )
            .await
            .unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.result_ref.is_none());

        // Terminal jobs accept no further transitions.
        let err = store
            .mark_succeeded(failed.id, failed.version, "outputs/x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn quota_ceiling_is_enforced_and_released() {
        let store = MemoryJobStore::new();
        let a = store.create(new_job("owner"), 2).await.unwrap();
        let _b = store.create(new_job("owner"), 2).await.unwrap();

        let err = store.create(new_job("owner"), 2).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));

        // Finishing a job frees a slot.
        let running = store.mark_running(a.id, a.version).await.unwrap();
        store
            .mark_succeeded(running.id, running.version, "outputs/a.pdf")
            .await
            .unwrap();
        store.create(new_job("owner"), 2).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_flag_rejected_on_terminal_jobs() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job("o1"), 5).await.unwrap();
        let running = store.mark_running(job.id, job.version).await.unwrap();
        store
            .mark_cancelled(running.id, running.version)
            .await
            .unwrap();

        assert!(store.request_cancel(job.id).await.unwrap().is_none());
    }
}

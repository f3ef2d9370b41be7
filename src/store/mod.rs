//! Job store: durable record of job state with version-guarded transitions.
//!
//! Every status transition is optimistic: the caller supplies the `version`
//! it last read, and the store applies the update only if the record still
//! carries that version and the expected source status. A stale caller gets
//! `Conflict` and must re-read. This is the sole mechanism arbitrating
//! redelivery races between workers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::job::{Job, JobError, NewJob};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found")]
    NotFound,

    #[error("version conflict")]
    Conflict,

    #[error("owner {owner_id} at in-flight ceiling {ceiling}")]
    QuotaExceeded { owner_id: String, ceiling: i32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job record: {0}")]
    Decode(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically reserve a quota slot for the owner (increment-with-ceiling)
    /// and persist the new job in `queued` state. `QuotaExceeded` if the
    /// owner already has `quota_ceiling` jobs in flight.
    async fn create(&self, job: NewJob, quota_ceiling: i32) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// `queued -> running`; increments `attempt_count`, stamps `started_at`.
    async fn mark_running(&self, id: Uuid, version: i64) -> Result<Job, StoreError>;

    /// `running -> succeeded`; records `result_ref`, releases the quota slot.
    async fn mark_succeeded(
        &self,
        id: Uuid,
        version: i64,
        result_ref: &str,
    ) -> Result<Job, StoreError>;

    /// `{queued, running} -> failed`; records the error, releases the quota
    /// slot. Queued jobs can be failed directly when their message is
    /// dead-lettered.
    async fn mark_failed(&self, id: Uuid, version: i64, error: &JobError)
        -> Result<Job, StoreError>;

    /// `{queued, running} -> cancelled`; releases the quota slot.
    async fn mark_cancelled(&self, id: Uuid, version: i64) -> Result<Job, StoreError>;

    /// `running -> queued`: retry requeue or stale-lease reconciliation.
    /// The attempt counter is left alone; it advances on claim.
    async fn requeue(&self, id: Uuid, version: i64) -> Result<Job, StoreError>;

    /// Set the cooperative cancellation flag on a non-terminal job. Returns
    /// `None` when the job is missing or already terminal; the caller
    /// re-reads to tell which.
    async fn request_cancel(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Number of jobs currently in `running` state.
    async fn running_count(&self) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

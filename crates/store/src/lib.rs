//! Storage for pipeline job records.
//!
//! The store is the source of truth for jobs. All status writes go through
//! compare-and-update on the record's resource version so concurrent
//! reconcilers cannot lose updates, and every write is published to watchers.

pub mod memory;

use async_trait::async_trait;
use lighthouse_core::job::{Job, JobStatus};
use thiserror::Error;

pub use memory::InMemoryJobStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} already exists")]
    AlreadyExists(String),
    #[error("conflict updating job {name}: expected version {expected}, found {found}")]
    Conflict { name: String, expected: u64, found: u64 },
    #[error("invalid state transition for job {0}")]
    InvalidTransition(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A change published to watchers. `old` is `None` for creates and `new` is
/// `None` for deletes.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub name: String,
    pub old: Option<Job>,
    pub new: Option<Job>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. The stored copy, with its resource version assigned,
    /// is returned.
    async fn create(&self, job: Job) -> Result<Job>;

    async fn get(&self, name: &str) -> Result<Option<Job>>;

    async fn list(&self) -> Result<Vec<Job>>;

    /// Replace the status of `name`, guarded by the resource version the
    /// caller read. A terminal recorded state refuses non-terminal overwrite.
    async fn update_status(
        &self,
        name: &str,
        resource_version: u64,
        status: JobStatus,
    ) -> Result<Job>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Subscribe to job changes. Slow consumers may observe lag; they are
    /// expected to re-list.
    fn watch(&self) -> tokio::sync::broadcast::Receiver<JobUpdate>;
}

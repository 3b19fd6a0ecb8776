//! In-memory job store.
//!
//! Process-local source of truth with the same compare-and-update contract a
//! cluster-backed store provides.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lighthouse_core::job::{Job, JobStatus};
use tokio::sync::broadcast;

use crate::{JobStore, JobUpdate, Result, StoreError};

const WATCH_BUFFER: usize = 256;

pub struct InMemoryJobStore {
    state: Mutex<State>,
    updates: broadcast::Sender<JobUpdate>,
}

struct State {
    jobs: BTreeMap<String, Job>,
    next_version: u64,
}

impl Default for InMemoryJobStore {
    fn default() -> Self { InMemoryJobStore::new() }
}

impl InMemoryJobStore {
    pub fn new() -> InMemoryJobStore {
        let (updates, _) = broadcast::channel(WATCH_BUFFER);
        InMemoryJobStore {
            state: Mutex::new(State { jobs: BTreeMap::new(), next_version: 0 }),
            updates,
        }
    }

    fn publish(&self, update: JobUpdate) {
        // Send fails only when nobody is watching.
        let _ = self.updates.send(update);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, mut job: Job) -> Result<Job> {
        let update = {
            let mut state = self.lock();
            if state.jobs.contains_key(&job.name) {
                return Err(StoreError::AlreadyExists(job.name));
            }
            state.next_version += 1;
            job.resource_version = state.next_version;
            state.jobs.insert(job.name.clone(), job.clone());
            JobUpdate { name: job.name.clone(), old: None, new: Some(job.clone()) }
        };
        self.publish(update);
        Ok(job)
    }

    async fn get(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.lock().jobs.values().cloned().collect())
    }

    async fn update_status(
        &self,
        name: &str,
        resource_version: u64,
        status: JobStatus,
    ) -> Result<Job> {
        let (update, job) = {
            let mut state = self.lock();
            let Some(current) = state.jobs.get(name) else {
                return Err(StoreError::NotFound(name.to_string()));
            };
            if current.resource_version != resource_version {
                return Err(StoreError::Conflict {
                    name: name.to_string(),
                    expected: resource_version,
                    found: current.resource_version,
                });
            }
            if let (Some(recorded), next) = (current.status.state, status.state)
                && recorded.is_terminal()
                && next != Some(recorded)
            {
                return Err(StoreError::InvalidTransition(name.to_string()));
            }
            let old = current.clone();
            state.next_version += 1;
            let version = state.next_version;
            let job = state.jobs.get_mut(name).expect("checked above");
            job.status = status;
            job.resource_version = version;
            let job = job.clone();
            (JobUpdate { name: name.to_string(), old: Some(old), new: Some(job.clone()) }, job)
        };
        self.publish(update);
        Ok(job)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let update = {
            let mut state = self.lock();
            let Some(job) = state.jobs.remove(name) else {
                return Err(StoreError::NotFound(name.to_string()));
            };
            JobUpdate { name: name.to_string(), old: Some(job), new: None }
        };
        self.publish(update);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<JobUpdate> { self.updates.subscribe() }
}

#[cfg(test)]
mod tests {
    use lighthouse_core::job::{JobSpec, JobType, PipelineState};

    use super::*;

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            spec: JobSpec {
                job_type: JobType::Presubmit,
                job: "unit".to_string(),
                ..JobSpec::default()
            },
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let store = InMemoryJobStore::new();
        let created = store.create(job("a")).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert!(matches!(
            store.create(job("a")).await,
            Err(StoreError::AlreadyExists(name)) if name == "a"
        ));
        store.create(job("b")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_update() {
        let store = InMemoryJobStore::new();
        let created = store.create(job("a")).await.unwrap();

        let mut status = JobStatus { state: Some(PipelineState::Pending), ..JobStatus::default() };
        let updated =
            store.update_status("a", created.resource_version, status.clone()).await.unwrap();
        assert!(updated.resource_version > created.resource_version);

        // A writer holding the stale version loses.
        status.state = Some(PipelineState::Running);
        let err = store.update_status("a", created.resource_version, status).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = InMemoryJobStore::new();
        let created = store.create(job("a")).await.unwrap();
        let done = store
            .update_status(
                "a",
                created.resource_version,
                JobStatus { state: Some(PipelineState::Success), ..JobStatus::default() },
            )
            .await
            .unwrap();
        let err = store
            .update_status(
                "a",
                done.resource_version,
                JobStatus { state: Some(PipelineState::Running), ..JobStatus::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_watch_sees_writes() {
        let store = InMemoryJobStore::new();
        let mut watch = store.watch();
        let created = store.create(job("a")).await.unwrap();
        store
            .update_status(
                "a",
                created.resource_version,
                JobStatus { state: Some(PipelineState::Pending), ..JobStatus::default() },
            )
            .await
            .unwrap();
        store.delete("a").await.unwrap();

        let create = watch.recv().await.unwrap();
        assert!(create.old.is_none() && create.new.is_some());
        let update = watch.recv().await.unwrap();
        assert_ne!(
            update.old.as_ref().unwrap().resource_version,
            update.new.as_ref().unwrap().resource_version
        );
        let delete = watch.recv().await.unwrap();
        assert!(delete.new.is_none());
    }
}

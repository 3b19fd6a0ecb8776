//! Turns a job spec into a running pipeline: one engine execution plus one
//! stored job record tracking it.

pub mod engine;

use std::sync::Arc;

use anyhow::{Context, Result};
use lighthouse_core::job::{BUILD_NUM_LABEL, Job, JobStatus, JobType, PipelineState, to_valid_name};
use lighthouse_scm::types::Repository;
use lighthouse_store::JobStore;
use time::OffsetDateTime;

use crate::engine::{PipelineCreateParams, PipelineEngine, PipelineKind};

pub struct Launcher {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn PipelineEngine>,
}

impl Launcher {
    pub fn new(store: Arc<dyn JobStore>, engine: Arc<dyn PipelineEngine>) -> Launcher {
        Launcher { store, engine }
    }

    /// Create a pipeline execution for `job` against `repository` and store
    /// the job record tracking it.
    ///
    /// If applying the engine resources fails after the record was written,
    /// the pending record is left in place for the status reconciler to time
    /// out, and the error is surfaced.
    pub async fn launch(&self, mut job: Job, repository: &Repository) -> Result<Job> {
        let spec = &job.spec;
        let branch = resolve_branch(spec, repository);
        let pull_refs = match &spec.refs {
            Some(refs) if !refs.pulls.is_empty() => refs.pull_refs(),
            _ => format!("{branch}:"),
        };
        let has_pulls = spec.refs.as_ref().is_some_and(|r| !r.pulls.is_empty());
        let params = PipelineCreateParams {
            source_url: source_url(spec, repository),
            branch: branch.clone(),
            pull_refs,
            kind: if has_pulls { PipelineKind::PullRequest } else { PipelineKind::Release },
            context: spec.context().to_string(),
            env: spec.env_vars(),
        };

        tracing::info!(
            owner = %repository.namespace,
            repo = %repository.name,
            branch = %branch,
            job = %spec.job,
            pull_refs = %params.pull_refs,
            "Launching pipeline"
        );

        let (key, resources) =
            self.engine.create(&params).await.context("Failed to create pipeline execution")?;

        if job.name.is_empty() {
            job.name = to_valid_name(&format!(
                "{}-{}-{}",
                repository.namespace, repository.name, spec.job
            ));
            if !key.build.is_empty() {
                job.name = format!("{}-{}", job.name, key.build);
            }
        }
        job.labels.insert(BUILD_NUM_LABEL.to_string(), key.build.clone());
        job.status = JobStatus {
            state: Some(PipelineState::Pending),
            activity_name: to_valid_name(&key.name),
            start_time: Some(OffsetDateTime::now_utc()),
            ..JobStatus::default()
        };

        let stored = self.store.create(job).await.context("Failed to store job record")?;

        self.engine
            .apply(&key, resources)
            .await
            .context("Failed to apply pipeline resources")?;
        Ok(stored)
    }
}

fn source_url(spec: &lighthouse_core::job::JobSpec, repository: &Repository) -> String {
    if !repository.clone_url.is_empty() {
        return repository.clone_url.clone();
    }
    spec.refs.as_ref().map(|r| r.clone_url.clone()).unwrap_or_default()
}

/// Branch the pipeline runs under: base ref for postsubmit, `batch` for
/// batches, `PR-<n>` for presubmits, then base ref → repo default → `master`.
fn resolve_branch(spec: &lighthouse_core::job::JobSpec, repository: &Repository) -> String {
    let base_ref =
        spec.refs.as_ref().map(|r| r.base_ref.clone()).unwrap_or_default();
    let branch = match spec.job_type {
        JobType::Postsubmit => base_ref,
        JobType::Batch => "batch".to_string(),
        _ => match spec.refs.as_ref().and_then(|r| r.pulls.first()) {
            Some(pull) => format!("PR-{}", pull.number),
            None => base_ref,
        },
    };
    if !branch.is_empty() {
        return branch;
    }
    if !repository.branch.is_empty() {
        return repository.branch.clone();
    }
    "master".to_string()
}

#[cfg(test)]
mod tests {
    use lighthouse_core::job::{JobSpec, Pull, Refs};
    use lighthouse_store::InMemoryJobStore;

    use super::engine::RecordingEngine;
    use super::*;

    fn repository() -> Repository {
        Repository {
            namespace: "org".to_string(),
            name: "repo".to_string(),
            branch: "main".to_string(),
            clone_url: "https://github.com/org/repo.git".to_string(),
            ..Repository::default()
        }
    }

    fn presubmit_spec() -> JobSpec {
        JobSpec {
            job_type: JobType::Presubmit,
            job: "unit".to_string(),
            refs: Some(Refs {
                org: "org".to_string(),
                repo: "repo".to_string(),
                base_ref: "master".to_string(),
                base_sha: "def".to_string(),
                pulls: vec![Pull { number: 7, sha: "abc".to_string(), ..Pull::default() }],
                ..Refs::default()
            }),
            ..JobSpec::default()
        }
    }

    #[tokio::test]
    async fn test_launch_presubmit() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(RecordingEngine::default());
        let launcher = Launcher::new(store.clone(), engine.clone());

        let job = Job { spec: presubmit_spec(), ..Job::default() };
        let stored = launcher.launch(job, &repository()).await.unwrap();

        assert_eq!(stored.status.state, Some(PipelineState::Pending));
        assert!(!stored.status.activity_name.is_empty());
        assert_eq!(stored.labels.get(BUILD_NUM_LABEL).map(String::as_str), Some("1"));
        assert_eq!(stored.name, "org-repo-unit-1");

        let state = engine.state.lock().unwrap();
        assert_eq!(state.created.len(), 1);
        let params = &state.created[0];
        assert_eq!(params.branch, "PR-7");
        assert_eq!(params.kind, PipelineKind::PullRequest);
        assert_eq!(params.pull_refs, "master:def,7:abc");
        assert_eq!(params.env.get("JOB_NAME").map(String::as_str), Some("unit"));
        assert_eq!(params.env.get("PULL_REFS").map(String::as_str), Some("master:def,7:abc"));
        assert_eq!(state.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_launch_postsubmit_release() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(RecordingEngine::default());
        let launcher = Launcher::new(store.clone(), engine.clone());

        let mut spec = presubmit_spec();
        spec.job_type = JobType::Postsubmit;
        spec.refs.as_mut().unwrap().pulls.clear();
        launcher.launch(Job { spec, ..Job::default() }, &repository()).await.unwrap();

        let state = engine.state.lock().unwrap();
        assert_eq!(state.created[0].branch, "master");
        assert_eq!(state.created[0].kind, PipelineKind::Release);
        assert_eq!(state.created[0].pull_refs, "master:");
    }

    #[tokio::test]
    async fn test_branch_fallback_chain() {
        // No base ref, no pulls: falls to the repo default, then master.
        let mut spec = presubmit_spec();
        spec.refs.as_mut().unwrap().pulls.clear();
        spec.refs.as_mut().unwrap().base_ref = String::new();
        assert_eq!(resolve_branch(&spec, &repository()), "main");

        let mut bare = repository();
        bare.branch = String::new();
        assert_eq!(resolve_branch(&spec, &bare), "master");
    }

    #[tokio::test]
    async fn test_apply_failure_leaves_pending_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(RecordingEngine::default());
        engine.state.lock().unwrap().fail_apply = true;
        let launcher = Launcher::new(store.clone(), engine);

        let result = launcher.launch(Job { spec: presubmit_spec(), ..Job::default() }, &repository()).await;
        assert!(result.is_err());

        // The record exists in pending for the reconciler to time out.
        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status.state, Some(PipelineState::Pending));
    }
}

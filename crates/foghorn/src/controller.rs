//! The status reconciler: watches job records, projects pipeline activity
//! into job status, and posts commit statuses and PR comments exactly once
//! per observed change.

use std::sync::Arc;

use anyhow::{Context, Result};
use lighthouse_core::activity::ActivityRecord;
use lighthouse_core::agent::{ConfigAgent, PluginAgent};
use lighthouse_core::job::{Job, JobStatus};
use lighthouse_plugins::external::ExternalDispatcher;
use lighthouse_scm::ScmProvider;
use lighthouse_scm::types::{StatusInput, StatusState};
use lighthouse_store::{JobStore, JobUpdate, StoreError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::queue::WorkQueue;
use crate::report::{DEFAULT_TARGET_TEMPLATE, ReportParams, render_target_url, status_for_activity};
use crate::reporter;

pub const DEFAULT_WORKERS: usize = 2;

pub struct Controller {
    store: Arc<dyn JobStore>,
    scm: Arc<dyn ScmProvider>,
    config: Arc<ConfigAgent>,
    plugins: Arc<PluginAgent>,
    external: Arc<ExternalDispatcher>,
    queue: Arc<WorkQueue>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn JobStore>,
        scm: Arc<dyn ScmProvider>,
        config: Arc<ConfigAgent>,
        plugins: Arc<PluginAgent>,
        external: Arc<ExternalDispatcher>,
    ) -> Controller {
        Controller { store, scm, config, plugins, external, queue: Arc::new(WorkQueue::new()) }
    }

    /// Run the informer and `workers` reconcile workers until cancelled, then
    /// drain the queue.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        tracing::info!(workers, "Starting status reconciler");
        let mut watch = self.store.watch();
        // Initial sync: pick up jobs written before the subscription.
        match self.store.list().await {
            Ok(jobs) => {
                for job in jobs {
                    self.queue.add(&job.name);
                }
            }
            Err(e) => tracing::error!("Failed to list jobs for initial sync: {e}"),
        }
        let informer = {
            let controller = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        update = watch.recv() => match update {
                            Ok(update) => controller.enqueue(&update),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "Informer lagged, re-listing jobs");
                                if let Ok(jobs) = controller.store.list().await {
                                    for job in jobs {
                                        controller.queue.add(&job.name);
                                    }
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let controller = self.clone();
            set.spawn(async move { controller.worker_loop().await });
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        while set.join_next().await.is_some() {}
        informer.abort();
        tracing::info!("Status reconciler stopped");
    }

    fn enqueue(&self, update: &JobUpdate) {
        match (&update.old, &update.new) {
            // Skip no-op resyncs; only real version changes matter.
            (Some(old), Some(new)) if old.resource_version != new.resource_version => {
                self.queue.add(&update.name);
            }
            (Some(_), None) => self.queue.add(&update.name),
            _ => {}
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        while let Some(key) = self.queue.next().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    tracing::error!(job = %key, "Failed to reconcile: {e:?}");
                    self.queue.requeue_failed(&key);
                }
            }
            self.queue.done(&key);
        }
    }

    /// One reconcile step for the job named `key`.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let Some(job) = self.store.get(key).await.context("Failed to fetch job")? else {
            // Deleted while queued; nothing to clean up beyond the record.
            return Ok(());
        };
        let Some(activity) = job.status.activity.clone() else {
            return Ok(());
        };

        let mut status = job.status.clone();
        project_activity(&mut status, &activity);
        self.report_status(&job, &activity, &mut status).await;

        if status != job.status {
            match self.store.update_status(key, job.resource_version, status).await {
                Ok(_) => {}
                Err(e @ StoreError::Conflict { .. }) => {
                    return Err(anyhow::Error::new(e).context("Lost status update race"));
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => tracing::warn!(job = %key, "Refusing status write: {e}"),
            }
        }
        Ok(())
    }

    /// Post the commit status and PR comment for `activity` when the desired
    /// report differs from the last one. Posting failures are logged and left
    /// for the next activity change to retry.
    async fn report_status(&self, job: &Job, activity: &ActivityRecord, status: &mut JobStatus) {
        let owner = &activity.owner;
        let repo = &activity.repo;
        let sha = &activity.last_commit_sha;
        if activity.git_url.is_empty() || sha.is_empty() || owner.is_empty() || repo.is_empty() {
            tracing::debug!(activity = %activity.name, "Not reporting, incomplete git coordinates");
            return;
        }

        let info = status_for_activity(activity, self.scm.kind());
        if info.state == StatusState::Unknown {
            return;
        }
        // Concluded reports are never re-sent, e.g. when a promotion pipeline
        // updates the activity after the PR merged.
        if StatusState::parse(&status.last_report_state).is_concluded() {
            return;
        }
        if status.last_report_state == info.state.as_str()
            && status.description == info.description
        {
            return;
        }

        let label = if activity.context.is_empty() {
            job.spec.context().to_string()
        } else {
            activity.context.clone()
        };
        let mut input = StatusInput {
            state: info.state,
            label,
            description: info.description.clone(),
            target: String::new(),
        };
        if let Some(config) = self.config.snapshot()
            && !config.report.url_base.is_empty()
        {
            let params = ReportParams {
                base_url: config.report.url_base.trim_end_matches('/').to_string(),
                team: if config.report.url_team.is_empty() {
                    owner.clone()
                } else {
                    config.report.url_team.clone()
                },
                owner: owner.clone(),
                repository: repo.clone(),
                branch: activity.branch.clone(),
                build: activity.build_identifier.clone(),
                context: input.label.clone(),
            };
            match render_target_url(DEFAULT_TARGET_TEMPLATE, &params) {
                Ok(url) if url.starts_with("http://") || url.starts_with("https://") => {
                    input.target = url;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to render target URL: {e}"),
            }
        }

        if let Err(e) = self.scm.create_status(owner, repo, sha, &input).await {
            tracing::warn!(
                owner = %owner,
                repo = %repo,
                sha = %sha,
                target = %input.target,
                "Failed to report commit status: {e:?}"
            );
            return;
        }
        tracing::info!(
            owner = %owner,
            repo = %repo,
            sha = %sha,
            state = %info.state,
            "Reported commit status"
        );

        if let Some(plugins) = self.plugins.snapshot() {
            let subscribed: Vec<_> = plugins
                .external_plugins_for(&format!("{owner}/{repo}"), "activity")
                .into_iter()
                .cloned()
                .collect();
            if !subscribed.is_empty() {
                match serde_json::to_vec(activity) {
                    Ok(body) => self.external.dispatch(subscribed, "activity", Arc::new(body)),
                    Err(e) => tracing::warn!("Failed to encode activity payload: {e}"),
                }
            }
        }

        if !input.target.is_empty() {
            status.report_url = input.target;
        }
        status.description = info.description;
        status.last_report_state = info.state.as_str().to_string();

        let mut reported = job.clone();
        reported.status = status.clone();
        if let Err(e) = reporter::report(self.scm.as_ref(), &reported).await {
            tracing::warn!(job = %job.name, "Failed to update PR comment: {e:?}");
        }
    }
}

/// Copy activity progress into the job status without regressing monotone
/// fields.
fn project_activity(status: &mut JobStatus, activity: &ActivityRecord) {
    if let Some(state) = activity.status {
        status.transition(state);
    }
    if !activity.last_commit_sha.is_empty() {
        status.last_commit_sha = activity.last_commit_sha.clone();
    }
    if status.completion_time.is_none() {
        status.completion_time = activity.completion_time;
    }
}

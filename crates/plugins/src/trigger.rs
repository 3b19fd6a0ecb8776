//! Launches configured pipelines in response to PR and push events.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lighthouse_core::config::JobDef;
use lighthouse_core::job::{Job, JobSpec, JobType, Refs};
use lighthouse_scm::convert;
use lighthouse_scm::types::Repository;
use lighthouse_scm::webhook::{HookAction, PullRequestHook, PushHook, Webhook, WebhookKind};

use crate::{Plugin, PluginContext};

pub struct Trigger;

#[async_trait]
impl Plugin for Trigger {
    fn name(&self) -> &'static str { "trigger" }

    fn events(&self) -> &'static [WebhookKind] { &[WebhookKind::PullRequest, WebhookKind::Push] }

    async fn handle(&self, ctx: &PluginContext, event: &Webhook) -> Result<()> {
        match event {
            Webhook::PullRequest(hook) => self.handle_pull_request(ctx, hook).await,
            Webhook::Push(hook) => self.handle_push(ctx, hook).await,
            _ => Ok(()),
        }
    }
}

impl Trigger {
    async fn handle_pull_request(
        &self,
        ctx: &PluginContext,
        hook: &PullRequestHook,
    ) -> Result<()> {
        if !matches!(
            hook.action,
            HookAction::Opened | HookAction::Reopened | HookAction::Synchronized
        ) {
            return Ok(());
        }
        let repository = &hook.repository;
        let pr = &hook.pull_request;
        let full_name = repository.full_name();
        let presubmits: Vec<&JobDef> = ctx
            .config
            .presubmits_for(&full_name)
            .iter()
            .filter(|p| p.matches_branch(&pr.base_ref))
            .collect();
        if presubmits.is_empty() {
            return Ok(());
        }
        let refs = convert::refs_for(repository, &pr.base_ref, &pr.base_sha, &[pr]);
        for presubmit in presubmits {
            if self.job_in_flight(ctx, &full_name, &pr.sha, &presubmit.name).await? {
                tracing::info!(
                    repo = %full_name,
                    job = %presubmit.name,
                    sha = %pr.sha,
                    "Skipping trigger, job already in flight"
                );
                continue;
            }
            launch(ctx, repository, presubmit, JobType::Presubmit, refs.clone()).await?;
        }
        Ok(())
    }

    async fn handle_push(&self, ctx: &PluginContext, hook: &PushHook) -> Result<()> {
        let repository = &hook.repository;
        let branch = hook.branch();
        let full_name = repository.full_name();
        let refs = Refs {
            org: repository.namespace.clone(),
            repo: repository.name.clone(),
            repo_link: repository.link.clone(),
            base_ref: branch.to_string(),
            base_sha: hook.after.clone(),
            clone_url: repository.clone_url.clone(),
            ..Refs::default()
        };
        for postsubmit in ctx.config.postsubmits_for(&full_name) {
            if !postsubmit.matches_branch(branch) {
                continue;
            }
            launch(ctx, repository, postsubmit, JobType::Postsubmit, refs.clone()).await?;
        }
        Ok(())
    }

    /// A non-terminal job already covering (repo, head SHA, job name)?
    async fn job_in_flight(
        &self,
        ctx: &PluginContext,
        full_name: &str,
        sha: &str,
        job_name: &str,
    ) -> Result<bool> {
        let jobs = ctx.store.list().await.context("Failed to list jobs")?;
        Ok(jobs.iter().any(|job| {
            job.spec.job == job_name
                && job.spec.job_type == JobType::Presubmit
                && !job.status.state.is_some_and(|s| s.is_terminal())
                && job.spec.refs.as_ref().is_some_and(|refs| {
                    refs.full_name() == full_name && refs.pulls.iter().any(|p| p.sha == sha)
                })
        }))
    }
}

async fn launch(
    ctx: &PluginContext,
    repository: &Repository,
    def: &JobDef,
    job_type: JobType,
    refs: Refs,
) -> Result<()> {
    let job = Job {
        spec: JobSpec {
            job_type,
            job: def.name.clone(),
            context: def.context().to_string(),
            refs: Some(refs),
            rerun_command: def.rerun_command.clone(),
            max_concurrency: def.max_concurrency,
        },
        ..Job::default()
    };
    ctx.launcher
        .launch(job, repository)
        .await
        .with_context(|| format!("Failed to launch {} {}", job_type, def.name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lighthouse_core::config::Config;
    use lighthouse_core::job::PipelineState;
    use lighthouse_launcher::Launcher;
    use lighthouse_launcher::engine::RecordingEngine;
    use lighthouse_scm::fake::{FakeGit, FakeScm};
    use lighthouse_scm::types::{PullRequest, User};
    use lighthouse_store::{InMemoryJobStore, JobStore};

    use super::*;

    fn context() -> (PluginContext, Arc<InMemoryJobStore>, Arc<RecordingEngine>) {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(RecordingEngine::default());
        let launcher = Arc::new(Launcher::new(store.clone(), engine.clone()));
        let config = Config::from_yaml(
            r#"
presubmits:
  org/repo:
    - name: unit
      branches: [master]
postsubmits:
  org/repo:
    - name: release
      branches: [master]
"#,
        )
        .unwrap();
        let ctx = PluginContext {
            scm: Arc::new(FakeScm::default()),
            git: Arc::new(FakeGit::default()),
            store: store.clone(),
            launcher,
            bot_name: "lighthouse-bot".to_string(),
            config: Arc::new(config),
            plugin_config: Arc::new(Default::default()),
        };
        (ctx, store, engine)
    }

    fn repository() -> Repository {
        Repository {
            namespace: "org".to_string(),
            name: "repo".to_string(),
            branch: "master".to_string(),
            clone_url: "https://github.com/org/repo.git".to_string(),
            ..Repository::default()
        }
    }

    fn pr_hook() -> PullRequestHook {
        PullRequestHook {
            action: HookAction::Opened,
            pull_request: PullRequest {
                number: 7,
                sha: "abc".to_string(),
                base_ref: "master".to_string(),
                base_sha: "def".to_string(),
                author: User { login: "dev".to_string(), ..User::default() },
                ..PullRequest::default()
            },
            repository: repository(),
            sender: User::default(),
        }
    }

    #[tokio::test]
    async fn test_presubmit_trigger() {
        let (ctx, store, engine) = context();
        Trigger.handle(&ctx, &Webhook::PullRequest(pr_hook())).await.unwrap();

        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.spec.job_type, JobType::Presubmit);
        assert_eq!(job.spec.job, "unit");
        assert_eq!(job.status.state, Some(PipelineState::Pending));
        let refs = job.spec.refs.as_ref().unwrap();
        assert_eq!(refs.pulls.len(), 1);
        assert_eq!((refs.pulls[0].number, refs.pulls[0].sha.as_str()), (7, "abc"));

        let created = &engine.state.lock().unwrap().created;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].env.get("JOB_NAME").map(String::as_str), Some("unit"));
        assert_eq!(created[0].env.get("PULL_REFS").map(String::as_str), Some("master:def,7:abc"));
    }

    #[tokio::test]
    async fn test_redispatch_does_not_duplicate() {
        let (ctx, store, _) = context();
        let hook = Webhook::PullRequest(pr_hook());
        Trigger.handle(&ctx, &hook).await.unwrap();
        Trigger.handle(&ctx, &hook).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        // A terminal existing job no longer blocks a re-trigger.
        let jobs = store.list().await.unwrap();
        let done = &jobs[0];
        let mut status = done.status.clone();
        status.state = Some(PipelineState::Failure);
        store.update_status(&done.name, done.resource_version, status).await.unwrap();
        Trigger.handle(&ctx, &hook).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_branch_filter() {
        let (ctx, store, _) = context();
        let mut hook = pr_hook();
        hook.pull_request.base_ref = "develop".to_string();
        Trigger.handle(&ctx, &Webhook::PullRequest(hook)).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_triggers_postsubmit() {
        let (ctx, store, engine) = context();
        let hook = PushHook {
            git_ref: "refs/heads/master".to_string(),
            before: "000".to_string(),
            after: "fff".to_string(),
            repository: repository(),
            sender: User::default(),
        };
        Trigger.handle(&ctx, &Webhook::Push(hook)).await.unwrap();

        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].spec.job_type, JobType::Postsubmit);
        assert_eq!(jobs[0].spec.job, "release");
        let created = &engine.state.lock().unwrap().created;
        assert_eq!(created[0].pull_refs, "master:");
        assert_eq!(created[0].env.get("PULL_REFS").map(String::as_str), Some("master:fff"));
    }
}

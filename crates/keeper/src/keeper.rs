//! The merge coordinator: partitions open PRs into subpools, drives each
//! subpool through test/merge decisions once per cycle, and records every
//! action it takes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lighthouse_core::agent::ConfigAgent;
use lighthouse_core::config::{Config, KeeperConfig, KeeperQuery, MergeMethod};
use lighthouse_core::job::{Job, JobSpec, JobType, Pull};
use lighthouse_launcher::Launcher;
use lighthouse_scm::convert;
use lighthouse_scm::git::GitClient;
use lighthouse_scm::provider::{MergeDetails, MergeError};
use lighthouse_scm::types::{CommitStatus, PullRequest, StatusInput, StatusState};
use lighthouse_scm::ScmProvider;
use lighthouse_store::JobStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::history::{Action, History};
use crate::pool::{PoolState, SubPool};
use crate::ranking;

/// Status label the keeper reports its own verdict under.
pub const KEEPER_CONTEXT: &str = "keeper";
const IN_POOL_DESC: &str = "In merge pool.";
const NOT_MERGEABLE_DESC: &str = "Not mergeable.";

pub struct Keeper {
    scm: Arc<dyn ScmProvider>,
    git: Arc<dyn GitClient>,
    store: Arc<dyn JobStore>,
    launcher: Arc<Launcher>,
    config: Arc<ConfigAgent>,
    pub history: Arc<History>,
}

enum MergeOutcome {
    Merged,
    /// Transient refusal; the subpool is re-processed next cycle.
    Requeue(String),
    /// Merge conflict; the PR was labeled and sits out until it changes.
    Conflict(String),
    /// The subpool cannot make progress without operator help.
    Poison(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextVerdict {
    Green,
    Red,
    Pending,
}

impl Keeper {
    pub fn new(
        scm: Arc<dyn ScmProvider>,
        git: Arc<dyn GitClient>,
        store: Arc<dyn JobStore>,
        launcher: Arc<Launcher>,
        config: Arc<ConfigAgent>,
        history: Arc<History>,
    ) -> Keeper {
        Keeper { scm, git, store, launcher, config, history }
    }

    /// Periodic sync loop. Cycles never overlap: the next tick waits for the
    /// previous cycle to drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.history.load().await;
        tracing::info!("Starting merge coordinator");
        loop {
            let period = self
                .config
                .snapshot()
                .map(|c| c.keeper.sync_period_seconds)
                .unwrap_or(30)
                .max(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(period)) => {}
            }
            if let Err(e) = self.sync().await {
                tracing::error!("Sync cycle failed: {e:?}");
            }
        }
        self.history.flush().await;
        tracing::info!("Merge coordinator stopped");
    }

    /// One full reconciliation cycle over every managed subpool.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        let Some(config) = self.config.snapshot() else {
            return Ok(());
        };
        let pools = self.gather_subpools(&config).await;
        let parallelism = config.keeper.max_parallel_subpools.max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut set = JoinSet::new();
        for pool in pools {
            let keeper = self.clone();
            let config = config.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let key = pool.key();
                match keeper.sync_subpool(&config, pool).await {
                    Ok(state) => tracing::debug!(pool = %key, state = ?state, "Subpool synced"),
                    Err(e) => tracing::error!(pool = %key, "Subpool sync failed: {e:?}"),
                }
            });
        }
        while set.join_next().await.is_some() {}
        Ok(())
    }

    async fn gather_subpools(&self, config: &Config) -> Vec<SubPool> {
        let jobs = match self.store.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Failed to list jobs: {e}");
                Vec::new()
            }
        };
        let mut pools = Vec::new();
        for query in &config.keeper.queries {
            match self.gather_query(config, query, &jobs).await {
                Ok(mut query_pools) => pools.append(&mut query_pools),
                Err(e) => {
                    tracing::error!(repo = %query.full_name(), "Failed to build subpools: {e:?}");
                }
            }
        }
        pools
    }

    async fn gather_query(
        &self,
        config: &Config,
        query: &KeeperQuery,
        jobs: &[Job],
    ) -> Result<Vec<SubPool>> {
        let repository = self
            .scm
            .get_repo(&query.org, &query.repo)
            .await
            .context("Failed to fetch repository")?;
        let prs = self
            .scm
            .list_open_pull_requests(&query.org, &query.repo)
            .await
            .context("Failed to list open pull requests")?;
        let branches = self.scm.list_branches(&query.org, &query.repo).await.unwrap_or_default();

        let mut by_branch: BTreeMap<String, Vec<PullRequest>> = BTreeMap::new();
        for pr in prs {
            if query.matches_branch(&pr.base_ref) {
                by_branch.entry(pr.base_ref.clone()).or_default().push(pr);
            }
        }

        let full_name = query.full_name();
        let mut pools = Vec::new();
        for (branch, prs) in by_branch {
            // Refresh the base SHA; fall back to what the PRs report.
            let sha = branches
                .iter()
                .find(|b| b.name == branch)
                .map(|b| b.sha.clone())
                .or_else(|| prs.iter().map(|pr| pr.base_sha.clone()).find(|s| !s.is_empty()))
                .unwrap_or_default();
            let mut required_contexts = query.required_contexts.clone();
            for presubmit in config.presubmits_for(&full_name) {
                if presubmit.matches_branch(&branch) {
                    let context = presubmit.context().to_string();
                    if !required_contexts.contains(&context) {
                        required_contexts.push(context);
                    }
                }
            }
            let pool_jobs = jobs
                .iter()
                .filter(|job| {
                    matches!(job.spec.job_type, JobType::Presubmit | JobType::Batch)
                        && job.spec.refs.as_ref().is_some_and(|refs| {
                            refs.org == query.org
                                && refs.repo == query.repo
                                && refs.base_ref == branch
                        })
                })
                .cloned()
                .collect();
            pools.push(SubPool {
                org: query.org.clone(),
                repo: query.repo.clone(),
                branch,
                sha,
                repository: repository.clone(),
                prs,
                jobs: pool_jobs,
                required_contexts,
            });
        }
        Ok(pools)
    }

    /// Drive one subpool through the first applicable rule:
    /// merge-ready batch, merge-ready single, trigger batch, trigger single,
    /// wait, blocked.
    pub async fn sync_subpool(&self, config: &Config, pool: SubPool) -> Result<PoolState> {
        let keeper_cfg = &config.keeper;
        let mut reviews = HashMap::new();
        let mut statuses = HashMap::new();
        for pr in &pool.prs {
            reviews.insert(
                pr.number,
                self.scm.list_reviews(&pool.org, &pool.repo, pr.number).await.unwrap_or_default(),
            );
            statuses.insert(
                pr.number,
                self.scm
                    .list_statuses(&pool.org, &pool.repo, &pr.sha)
                    .await
                    .unwrap_or_default(),
            );
        }
        let candidates = ranking::filter_candidates(keeper_cfg, &pool.prs, &reviews);
        let ordered = ranking::order_candidates(keeper_cfg, candidates);
        self.report_keeper_contexts(&pool, &ordered, &statuses).await;

        if let Some(batch) = pool.mergeable_batch() {
            let pulls = batch.spec.refs.as_ref().map(|r| r.pulls.clone()).unwrap_or_default();
            return self.merge_pulls(keeper_cfg, &pool, pulls, Action::MergeBatch).await;
        }
        if let Some(invalidated) = pool.invalidated_batch()
            && !pool.batch_in_flight()
        {
            let pulls = invalidated.spec.refs.as_ref().map(|r| r.pulls.clone()).unwrap_or_default();
            self.history.record(
                &pool.key(),
                Action::Wait,
                &pool.sha,
                pulls,
                Some("batch invalidated by base advance".to_string()),
            );
        }

        let Some(top) = ordered.first() else {
            let blocking = keeper_cfg.all_blocking_labels();
            let blocked = pool
                .prs
                .iter()
                .any(|pr| blocking.iter().any(|label| pr.has_label(label)));
            return Ok(if blocked { PoolState::Blocked } else { PoolState::Clean });
        };

        let top_statuses = statuses.get(&top.number).map(Vec::as_slice).unwrap_or(&[]);
        match required_contexts_verdict(&pool.required_contexts, top_statuses) {
            ContextVerdict::Green => {
                let pull = convert::pull_from_pr(top);
                self.merge_pulls(keeper_cfg, &pool, vec![pull], Action::Merge).await
            }
            ContextVerdict::Red => Ok(PoolState::Stuck),
            ContextVerdict::Pending => {
                let batch = self.select_batch(keeper_cfg, &pool, &ordered).await;
                if batch.len() >= 2 && !pool.batch_in_flight() {
                    return self
                        .trigger(config, &pool, &batch, JobType::Batch, Action::TriggerBatch)
                        .await;
                }
                if pool.job_in_flight_for(&top.sha) || pool.batch_in_flight() {
                    return Ok(PoolState::Wait);
                }
                let has_presubmits = config
                    .presubmits_for(&pool.full_name())
                    .iter()
                    .any(|p| p.matches_branch(&pool.branch));
                if has_presubmits {
                    return self
                        .trigger(
                            config,
                            &pool,
                            std::slice::from_ref(top),
                            JobType::Presubmit,
                            Action::Trigger,
                        )
                        .await;
                }
                Ok(PoolState::Wait)
            }
        }
    }

    /// Report the keeper's own context on each PR head: success for pool
    /// members, pending otherwise. Unchanged statuses are not re-posted.
    async fn report_keeper_contexts(
        &self,
        pool: &SubPool,
        candidates: &[PullRequest],
        statuses: &HashMap<u64, Vec<CommitStatus>>,
    ) {
        for pr in &pool.prs {
            let in_pool = candidates.iter().any(|c| c.number == pr.number);
            let (state, description) = if in_pool {
                (StatusState::Success, IN_POOL_DESC)
            } else {
                (StatusState::Pending, NOT_MERGEABLE_DESC)
            };
            let current = statuses
                .get(&pr.number)
                .and_then(|list| list.iter().find(|s| s.label == KEEPER_CONTEXT));
            if current.is_some_and(|s| s.state == state && s.description == description) {
                continue;
            }
            let input = StatusInput {
                state,
                label: KEEPER_CONTEXT.to_string(),
                description: description.to_string(),
                target: String::new(),
            };
            if let Err(e) = self.scm.create_status(&pool.org, &pool.repo, &pr.sha, &input).await {
                tracing::warn!(pr = pr.number, "Failed to report keeper context: {e:?}");
            }
        }
    }

    /// The longest prefix of `ordered` (bounded by the batch cap) that merges
    /// cleanly, in order, onto the pool's base SHA.
    async fn select_batch(
        &self,
        keeper_cfg: &KeeperConfig,
        pool: &SubPool,
        ordered: &[PullRequest],
    ) -> Vec<PullRequest> {
        if ordered.len() < 2 {
            return Vec::new();
        }
        let cap = keeper_cfg.batch_size_limit.max(1);
        let mut batch: Vec<PullRequest> = Vec::new();
        let mut shas: Vec<String> = Vec::new();
        for pr in ordered.iter().take(cap) {
            shas.push(pr.sha.clone());
            match self
                .git
                .merges_cleanly(&pool.repository.clone_url, &pool.branch, &pool.sha, &shas)
                .await
            {
                Ok(true) => batch.push(pr.clone()),
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(pool = %pool.key(), "Batch dry-run failed: {e:?}");
                    break;
                }
            }
        }
        batch
    }

    /// Launch every configured presubmit as `job_type` against `prs`.
    async fn trigger(
        &self,
        config: &Config,
        pool: &SubPool,
        prs: &[PullRequest],
        job_type: JobType,
        action: Action,
    ) -> Result<PoolState> {
        let pr_refs: Vec<&PullRequest> = prs.iter().collect();
        let refs = convert::refs_for(&pool.repository, &pool.branch, &pool.sha, &pr_refs);
        let mut err = None;
        for def in config.presubmits_for(&pool.full_name()) {
            if !def.matches_branch(&pool.branch) {
                continue;
            }
            let job = Job {
                spec: JobSpec {
                    job_type,
                    job: def.name.clone(),
                    context: def.context().to_string(),
                    refs: Some(refs.clone()),
                    rerun_command: def.rerun_command.clone(),
                    max_concurrency: def.max_concurrency,
                },
                ..Job::default()
            };
            if let Err(e) = self.launcher.launch(job, &pool.repository).await {
                tracing::error!(pool = %pool.key(), job = %def.name, "Failed to launch: {e:?}");
                err = Some(format!("{e:#}"));
                break;
            }
        }
        self.history.record(&pool.key(), action, &pool.sha, refs.pulls, err);
        Ok(match action {
            Action::TriggerBatch => PoolState::TriggerBatch,
            _ => PoolState::Trigger,
        })
    }

    /// Merge `pulls` in order, reacting to each typed failure.
    async fn merge_pulls(
        &self,
        keeper_cfg: &KeeperConfig,
        pool: &SubPool,
        pulls: Vec<Pull>,
        action: Action,
    ) -> Result<PoolState> {
        let mut state =
            if action == Action::MergeBatch { PoolState::MergeBatch } else { PoolState::Merge };
        let mut recorded_action = action;
        let mut err = None;
        for pull in &pulls {
            match self.merge_one(keeper_cfg, pool, pull).await {
                MergeOutcome::Merged => {
                    tracing::info!(pool = %pool.key(), pr = pull.number, "Merged");
                }
                MergeOutcome::Requeue(message) => {
                    err = Some(message);
                    state = PoolState::Wait;
                    break;
                }
                MergeOutcome::Conflict(message) => {
                    err = Some(message);
                    state = PoolState::Blocked;
                    break;
                }
                MergeOutcome::Poison(message) => {
                    err = Some(message);
                    recorded_action = Action::Poison;
                    state = PoolState::Blocked;
                    break;
                }
            }
        }
        self.history.record(&pool.key(), recorded_action, &pool.sha, pulls, err);
        Ok(state)
    }

    async fn merge_one(
        &self,
        keeper_cfg: &KeeperConfig,
        pool: &SubPool,
        pull: &Pull,
    ) -> MergeOutcome {
        let details = MergeDetails {
            sha: pull.sha.clone(),
            method: Some(keeper_cfg.merge_method),
            ..MergeDetails::default()
        };
        let result =
            self.scm.merge_pull_request(&pool.org, &pool.repo, pull.number, details).await;
        match result {
            Ok(()) => MergeOutcome::Merged,
            Err(MergeError::ModifiedHead(message)) => MergeOutcome::Requeue(message),
            Err(MergeError::BaseChanged(message)) => MergeOutcome::Requeue(message),
            Err(MergeError::Unmergable(message)) => {
                self.mark_conflicted(keeper_cfg, pool, pull).await;
                MergeOutcome::Conflict(message)
            }
            Err(MergeError::MergeCommitsForbidden(message)) => {
                if keeper_cfg.merge_method == MergeMethod::Merge && keeper_cfg.squash_fallback {
                    let retry = MergeDetails {
                        sha: pull.sha.clone(),
                        method: Some(MergeMethod::Squash),
                        ..MergeDetails::default()
                    };
                    match self
                        .scm
                        .merge_pull_request(&pool.org, &pool.repo, pull.number, retry)
                        .await
                    {
                        Ok(()) => MergeOutcome::Merged,
                        Err(e) => MergeOutcome::Poison(e.to_string()),
                    }
                } else {
                    MergeOutcome::Poison(message)
                }
            }
            Err(MergeError::UnauthorizedToPush(message)) => {
                if let Err(e) = self
                    .scm
                    .add_label(&pool.org, &pool.repo, pull.number, &keeper_cfg.permission_label)
                    .await
                {
                    tracing::warn!(pr = pull.number, "Failed to add permission label: {e:?}");
                }
                MergeOutcome::Poison(message)
            }
            Err(MergeError::Provider(e)) => MergeOutcome::Requeue(format!("{e:#}")),
        }
    }

    /// Label and comment a conflicted PR so it sits out until it changes.
    async fn mark_conflicted(&self, keeper_cfg: &KeeperConfig, pool: &SubPool, pull: &Pull) {
        if let Err(e) = self
            .scm
            .add_label(&pool.org, &pool.repo, pull.number, &keeper_cfg.conflict_label)
            .await
        {
            tracing::warn!(pr = pull.number, "Failed to add conflict label: {e:?}");
        }
        let body = format!(
            "This pull request cannot be merged into `{}` because of conflicts. \
             Rebase it and the merge will be retried.",
            pool.branch
        );
        if let Err(e) = self.scm.create_comment(&pool.org, &pool.repo, pull.number, &body).await {
            tracing::warn!(pr = pull.number, "Failed to comment on conflict: {e:?}");
        }
    }
}

fn required_contexts_verdict(required: &[String], statuses: &[CommitStatus]) -> ContextVerdict {
    let mut verdict = ContextVerdict::Green;
    for context in required {
        match statuses.iter().find(|s| &s.label == context) {
            Some(status) if status.state == StatusState::Success => {}
            Some(status)
                if matches!(
                    status.state,
                    StatusState::Failure | StatusState::Error | StatusState::Canceled
                ) =>
            {
                return ContextVerdict::Red;
            }
            _ => verdict = ContextVerdict::Pending,
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use lighthouse_core::job::{JobStatus, PipelineState, Refs};
    use lighthouse_launcher::engine::RecordingEngine;
    use lighthouse_scm::fake::{FakeGit, FakeScm};
    use lighthouse_scm::types::{Label, Repository, User};
    use lighthouse_store::InMemoryJobStore;
    use time::OffsetDateTime;

    use super::*;

    struct Fixture {
        keeper: Arc<Keeper>,
        scm: Arc<FakeScm>,
        git: Arc<FakeGit>,
        store: Arc<InMemoryJobStore>,
        engine: Arc<RecordingEngine>,
        config: Arc<Config>,
    }

    fn fixture(yaml: &str) -> Fixture {
        let scm = Arc::new(FakeScm::default());
        let git = Arc::new(FakeGit::default());
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(RecordingEngine::default());
        let launcher = Arc::new(Launcher::new(store.clone(), engine.clone()));
        let config = Arc::new(Config::from_yaml(yaml).unwrap());
        let agent = Arc::new(ConfigAgent::new());
        agent.set((*config).clone());
        let keeper = Arc::new(Keeper::new(
            scm.clone(),
            git.clone(),
            store.clone(),
            launcher,
            agent,
            Arc::new(History::new(100)),
        ));
        scm.add_repo(Repository {
            namespace: "org".to_string(),
            name: "repo".to_string(),
            branch: "master".to_string(),
            clone_url: "https://github.com/org/repo.git".to_string(),
            ..Repository::default()
        });
        scm.lock().branches.insert(
            "org/repo".to_string(),
            vec![lighthouse_scm::types::Branch { name: "master".to_string(), sha: "d0".to_string() }],
        );
        Fixture { keeper, scm, git, store, engine, config }
    }

    const BASE_CONFIG: &str = r#"
presubmits:
  org/repo:
    - name: unit
keeper:
  queries:
    - org: org
      repo: repo
      branches: [master]
"#;

    fn pull_request(number: u64, labels: &[&str]) -> PullRequest {
        PullRequest {
            number,
            sha: format!("sha{number}"),
            base_ref: "master".to_string(),
            base_sha: "d0".to_string(),
            author: User { login: "dev".to_string(), ..User::default() },
            labels: labels.iter().map(|n| Label { name: n.to_string() }).collect(),
            created: Some(
                OffsetDateTime::from_unix_timestamp(1_700_000_000 + number as i64).unwrap(),
            ),
            ..PullRequest::default()
        }
    }

    fn green(sha: &str, scm: &FakeScm) {
        scm.set_statuses(
            sha,
            vec![CommitStatus {
                state: StatusState::Success,
                label: "unit".to_string(),
                ..CommitStatus::default()
            }],
        );
    }

    async fn run_sync(f: &Fixture) { f.keeper.sync().await.unwrap() }

    fn history_actions(f: &Fixture) -> Vec<Action> {
        f.keeper
            .history
            .all_records()
            .get("org/repo:master")
            .map(|records| records.iter().map(|r| r.action).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_trigger_single() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(7, &[]));
        run_sync(&f).await;

        let jobs = f.store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].spec.job_type, JobType::Presubmit);
        let refs = jobs[0].spec.refs.as_ref().unwrap();
        assert_eq!(refs.base_sha, "d0");
        assert_eq!(refs.pulls[0].number, 7);
        assert_eq!(history_actions(&f), vec![Action::Trigger]);

        // With the job in flight, the next cycle waits instead of re-firing.
        run_sync(&f).await;
        assert_eq!(f.store.list().await.unwrap().len(), 1);
        assert_eq!(history_actions(&f), vec![Action::Trigger]);
    }

    #[tokio::test]
    async fn test_merge_single_when_green() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(7, &[]));
        green("sha7", &f.scm);
        run_sync(&f).await;

        assert_eq!(f.scm.lock().merged, vec![7]);
        assert_eq!(history_actions(&f), vec![Action::Merge]);
    }

    #[tokio::test]
    async fn test_batch_selection_and_trigger() {
        let config = r#"
presubmits:
  org/repo:
    - name: unit
keeper:
  priority_labels: [p/high]
  queries:
    - org: org
      repo: repo
      branches: [master]
"#;
        let f = fixture(config);
        f.scm.add_pull("org/repo", pull_request(1, &[]));
        f.scm.add_pull("org/repo", pull_request(2, &["p/high"]));
        f.scm.add_pull("org/repo", pull_request(3, &["p/high"]));
        run_sync(&f).await;

        let jobs = f.store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.spec.job_type, JobType::Batch);
        let refs = job.spec.refs.as_ref().unwrap();
        assert_eq!(refs.base_sha, "d0");
        let numbers: Vec<u64> = refs.pulls.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![2, 3, 1]);
        assert_eq!(history_actions(&f), vec![Action::TriggerBatch]);
    }

    #[tokio::test]
    async fn test_batch_prefix_stops_at_conflict() {
        let config = r#"
presubmits:
  org/repo:
    - name: unit
keeper:
  queries:
    - org: org
      repo: repo
      branches: [master]
"#;
        let f = fixture(config);
        f.scm.add_pull("org/repo", pull_request(1, &[]));
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        f.scm.add_pull("org/repo", pull_request(3, &[]));
        // Ordering by age is 1, 2, 3; PR 2 conflicts in the dry run, so the
        // prefix collapses to a single PR and a plain trigger fires instead.
        f.git.conflicting.lock().unwrap().push("sha2".to_string());
        run_sync(&f).await;

        let jobs = f.store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].spec.job_type, JobType::Presubmit);
        let refs = jobs[0].spec.refs.as_ref().unwrap();
        assert_eq!(refs.pulls.len(), 1);
        assert_eq!(refs.pulls[0].number, 1);
    }

    #[tokio::test]
    async fn test_merge_batch_after_success() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(1, &[]));
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        // A finished batch job covering both PRs at the current base.
        let refs = Refs {
            org: "org".to_string(),
            repo: "repo".to_string(),
            base_ref: "master".to_string(),
            base_sha: "d0".to_string(),
            pulls: vec![
                Pull { number: 1, sha: "sha1".to_string(), ..Pull::default() },
                Pull { number: 2, sha: "sha2".to_string(), ..Pull::default() },
            ],
            ..Refs::default()
        };
        f.store
            .create(Job {
                name: "batch-1".to_string(),
                spec: JobSpec {
                    job_type: JobType::Batch,
                    job: "unit".to_string(),
                    refs: Some(refs),
                    ..JobSpec::default()
                },
                status: JobStatus {
                    state: Some(PipelineState::Success),
                    ..JobStatus::default()
                },
                ..Job::default()
            })
            .await
            .unwrap();

        run_sync(&f).await;
        assert_eq!(f.scm.lock().merged, vec![1, 2]);
        assert_eq!(history_actions(&f), vec![Action::MergeBatch]);
    }

    #[tokio::test]
    async fn test_modified_head_requeues() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        green("sha2", &f.scm);
        f.scm.script_merge_error(2, MergeError::ModifiedHead("head modified".to_string()));

        let pools = f.keeper.gather_subpools(&f.config).await;
        let state = f
            .keeper
            .sync_subpool(&f.config, pools.into_iter().next().unwrap())
            .await
            .unwrap();
        assert_eq!(state, PoolState::Wait);
        assert!(f.scm.lock().labels_added.is_empty());

        let records = f.keeper.history.all_records();
        let record = &records["org/repo:master"][0];
        assert_eq!(record.action, Action::Merge);
        assert_eq!(record.err, "head modified");
        assert_eq!(record.target[0].number, 2);

        // The head is unchanged next cycle, so the merge is retried.
        run_sync(&f).await;
        assert_eq!(f.scm.lock().merged, vec![2]);
    }

    #[tokio::test]
    async fn test_conflict_labels_and_comments() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        green("sha2", &f.scm);
        f.scm.script_merge_error(2, MergeError::Unmergable("merge conflict".to_string()));

        let pools = f.keeper.gather_subpools(&f.config).await;
        let state = f
            .keeper
            .sync_subpool(&f.config, pools.into_iter().next().unwrap())
            .await
            .unwrap();
        assert_eq!(state, PoolState::Blocked);
        {
            let scm = f.scm.lock();
            assert_eq!(scm.labels_added, vec![(2, "needs-rebase".to_string())]);
            assert_eq!(scm.created_comments.len(), 1);
        }

        // The conflict label now blocks the PR, so nothing merges until it
        // changes.
        run_sync(&f).await;
        assert!(f.scm.lock().merged.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_poisons_pool() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        green("sha2", &f.scm);
        f.scm.script_merge_error(2, MergeError::UnauthorizedToPush("forbidden".to_string()));
        run_sync(&f).await;

        assert_eq!(f.scm.lock().labels_added, vec![(2, "needs-ok-to-merge".to_string())]);
        assert_eq!(history_actions(&f), vec![Action::Poison]);
    }

    #[tokio::test]
    async fn test_squash_fallback() {
        let config = r#"
presubmits:
  org/repo:
    - name: unit
keeper:
  squash_fallback: true
  queries:
    - org: org
      repo: repo
      branches: [master]
"#;
        let f = fixture(config);
        f.scm.add_pull("org/repo", pull_request(2, &[]));
        green("sha2", &f.scm);
        f.scm.script_merge_error(2, MergeError::MergeCommitsForbidden("not allowed".to_string()));
        run_sync(&f).await;

        // The first attempt fails, the squash retry lands.
        assert_eq!(f.scm.lock().merged, vec![2]);
        assert_eq!(history_actions(&f), vec![Action::Merge]);
    }

    #[tokio::test]
    async fn test_red_contexts_stick_the_pool() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(7, &[]));
        f.scm.set_statuses(
            "sha7",
            vec![CommitStatus {
                state: StatusState::Failure,
                label: "unit".to_string(),
                ..CommitStatus::default()
            }],
        );
        let pools = f.keeper.gather_subpools(&f.config).await;
        let state = f
            .keeper
            .sync_subpool(&f.config, pools.into_iter().next().unwrap())
            .await
            .unwrap();
        assert_eq!(state, PoolState::Stuck);
        assert!(f.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keeper_context_reported() {
        let f = fixture(BASE_CONFIG);
        f.scm.add_pull("org/repo", pull_request(7, &["needs-rebase"]));
        run_sync(&f).await;

        let scm = f.scm.lock();
        let keeper_statuses: Vec<_> = scm
            .created_statuses
            .iter()
            .filter(|(_, input)| input.label == KEEPER_CONTEXT)
            .collect();
        assert_eq!(keeper_statuses.len(), 1);
        assert_eq!(keeper_statuses[0].1.state, StatusState::Pending);
        assert_eq!(keeper_statuses[0].1.description, NOT_MERGEABLE_DESC);
    }

    #[test]
    fn test_required_contexts_verdict() {
        let required = vec!["unit".to_string(), "lint".to_string()];
        let status = |label: &str, state: StatusState| CommitStatus {
            state,
            label: label.to_string(),
            ..CommitStatus::default()
        };
        assert_eq!(
            required_contexts_verdict(
                &required,
                &[status("unit", StatusState::Success), status("lint", StatusState::Success)],
            ),
            ContextVerdict::Green
        );
        assert_eq!(
            required_contexts_verdict(&required, &[status("unit", StatusState::Success)]),
            ContextVerdict::Pending
        );
        assert_eq!(
            required_contexts_verdict(
                &required,
                &[status("unit", StatusState::Running), status("lint", StatusState::Failure)],
            ),
            ContextVerdict::Red
        );
        assert_eq!(required_contexts_verdict(&[], &[]), ContextVerdict::Green);
    }
}

use lighthouse_core::job::{Job, JobType, PipelineState};
use lighthouse_scm::types::{PullRequest, Repository};

/// The PRs sharing (org, repo, base branch) within one sync cycle, plus the
/// in-flight jobs targeting them. Owned exclusively by the coordinator for
/// the duration of the cycle.
#[derive(Debug, Clone)]
pub struct SubPool {
    pub org: String,
    pub repo: String,
    pub branch: String,
    /// Base branch head at cycle start.
    pub sha: String,
    pub repository: Repository,
    pub prs: Vec<PullRequest>,
    pub jobs: Vec<Job>,
    pub required_contexts: Vec<String>,
}

impl SubPool {
    pub fn key(&self) -> String { format!("{}/{}:{}", self.org, self.repo, self.branch) }

    pub fn full_name(&self) -> String { format!("{}/{}", self.org, self.repo) }

    /// A non-terminal presubmit job testing `sha`?
    pub fn job_in_flight_for(&self, sha: &str) -> bool {
        self.jobs.iter().any(|job| {
            job.spec.job_type == JobType::Presubmit
                && !is_terminal(job)
                && job.spec.refs.as_ref().is_some_and(|r| r.pulls.iter().any(|p| p.sha == sha))
        })
    }

    /// A non-terminal batch job?
    pub fn batch_in_flight(&self) -> bool {
        self.jobs.iter().any(|job| job.spec.job_type == JobType::Batch && !is_terminal(job))
    }

    /// Successful batch jobs whose pulls all still point at the heads in this
    /// pool and whose base SHA has not advanced.
    pub fn mergeable_batch(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| {
            job.spec.job_type == JobType::Batch
                && job.status.state == Some(PipelineState::Success)
                && job.spec.refs.as_ref().is_some_and(|refs| {
                    refs.base_sha == self.sha
                        && !refs.pulls.is_empty()
                        && refs.pulls.iter().all(|pull| {
                            self.prs.iter().any(|pr| pr.number == pull.number && pr.sha == pull.sha)
                        })
                })
        })
    }

    /// A terminal success batch invalidated only by a base advance: worth a
    /// WAIT entry so operators can see why the batch was discarded.
    pub fn invalidated_batch(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| {
            job.spec.job_type == JobType::Batch
                && job.status.state == Some(PipelineState::Success)
                && job.spec.refs.as_ref().is_some_and(|refs| {
                    refs.base_sha != self.sha
                        && !refs.pulls.is_empty()
                        && refs.pulls.iter().all(|pull| {
                            self.prs.iter().any(|pr| pr.number == pull.number && pr.sha == pull.sha)
                        })
                })
        })
    }
}

fn is_terminal(job: &Job) -> bool {
    job.status.state.is_some_and(|s| s.is_terminal())
}

/// What the coordinator decided to do with a subpool this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Clean,
    Trigger,
    TriggerBatch,
    Merge,
    MergeBatch,
    Wait,
    Blocked,
    Stuck,
}

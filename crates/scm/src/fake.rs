//! Scripted in-memory provider for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::provider::{MergeDetails, MergeError, ScmProvider};
use crate::types::{
    Branch, Change, Comment, CommitStatus, Label, PullRequest, Repository, Review, StatusInput,
};

#[derive(Default)]
pub struct FakeState {
    pub repos: HashMap<String, Repository>,
    pub pulls: BTreeMap<(String, u64), PullRequest>,
    pub reviews: HashMap<(String, u64), Vec<Review>>,
    pub changes: HashMap<(String, u64), Vec<Change>>,
    /// Commit statuses keyed by SHA; `create_status` replaces by label.
    pub statuses: HashMap<String, Vec<CommitStatus>>,
    pub comments: HashMap<(String, u64), Vec<Comment>>,
    pub branches: HashMap<String, Vec<Branch>>,
    /// Scripted merge failures by PR number, consumed in order.
    pub merge_errors: HashMap<u64, VecDeque<MergeError>>,
    pub merged: Vec<u64>,
    pub labels_added: Vec<(u64, String)>,
    pub labels_removed: Vec<(u64, String)>,
    /// Every `create_status` call in order, with the target SHA.
    pub created_statuses: Vec<(String, StatusInput)>,
    pub created_comments: Vec<(u64, String)>,
    pub updated_comments: Vec<(u64, String)>,
    pub deleted_comments: Vec<u64>,
    pub hooks: Vec<String>,
    next_comment_id: u64,
}

pub struct FakeScm {
    bot: String,
    pub state: Mutex<FakeState>,
}

impl Default for FakeScm {
    fn default() -> Self { FakeScm::new("lighthouse-bot") }
}

impl FakeScm {
    pub fn new(bot: &str) -> FakeScm {
        FakeScm { bot: bot.to_string(), state: Mutex::new(FakeState::default()) }
    }

    pub fn add_repo(&self, repo: Repository) {
        self.lock().repos.insert(repo.full_name(), repo);
    }

    pub fn add_pull(&self, full_name: &str, pull: PullRequest) {
        self.lock().pulls.insert((full_name.to_string(), pull.number), pull);
    }

    pub fn set_statuses(&self, sha: &str, statuses: Vec<CommitStatus>) {
        self.lock().statuses.insert(sha.to_string(), statuses);
    }

    pub fn script_merge_error(&self, number: u64, error: MergeError) {
        self.lock().merge_errors.entry(number).or_default().push_back(error);
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ScmProvider for FakeScm {
    fn kind(&self) -> &str { "fake" }

    fn bot_name(&self) -> &str { &self.bot }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Repository> {
        self.lock()
            .repos
            .get(&format!("{owner}/{name}"))
            .cloned()
            .ok_or_else(|| anyhow!("unknown repository {owner}/{name}"))
    }

    async fn create_repo(&self, owner: &str, name: &str, _private: bool) -> Result<Repository> {
        let repo = Repository {
            namespace: owner.to_string(),
            name: name.to_string(),
            ..Repository::default()
        };
        self.lock().repos.insert(repo.full_name(), repo.clone());
        Ok(repo)
    }

    async fn list_branches(&self, owner: &str, name: &str) -> Result<Vec<Branch>> {
        Ok(self.lock().branches.get(&format!("{owner}/{name}")).cloned().unwrap_or_default())
    }

    async fn create_hook(&self, owner: &str, name: &str, url: &str, _secret: &str) -> Result<()> {
        self.lock().hooks.push(format!("{owner}/{name} -> {url}"));
        Ok(())
    }

    async fn find_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<PullRequest> {
        self.lock()
            .pulls
            .get(&(format!("{owner}/{name}"), number))
            .cloned()
            .ok_or_else(|| anyhow!("unknown pull request {owner}/{name}#{number}"))
    }

    async fn list_open_pull_requests(&self, owner: &str, name: &str) -> Result<Vec<PullRequest>> {
        let full_name = format!("{owner}/{name}");
        Ok(self
            .lock()
            .pulls
            .iter()
            .filter(|((repo, _), pr)| *repo == full_name && !pr.closed)
            .map(|(_, pr)| pr.clone())
            .collect())
    }

    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        _details: MergeDetails,
    ) -> Result<(), MergeError> {
        let mut state = self.lock();
        if let Some(error) = state.merge_errors.get_mut(&number).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(pull) = state.pulls.get_mut(&(format!("{owner}/{name}"), number)) {
            pull.closed = true;
        }
        state.merged.push(number);
        Ok(())
    }

    async fn reopen_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()> {
        if let Some(pull) = self.lock().pulls.get_mut(&(format!("{owner}/{name}"), number)) {
            pull.closed = false;
        }
        Ok(())
    }

    async fn close_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()> {
        if let Some(pull) = self.lock().pulls.get_mut(&(format!("{owner}/{name}"), number)) {
            pull.closed = true;
        }
        Ok(())
    }

    async fn list_comments(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Comment>> {
        Ok(self.lock().comments.get(&(format!("{owner}/{name}"), number)).cloned().unwrap_or_default())
    }

    async fn create_comment(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.next_comment_id += 1;
        let comment = Comment {
            id: state.next_comment_id,
            body: body.to_string(),
            author: crate::types::User { login: self.bot.clone(), ..Default::default() },
        };
        state.created_comments.push((number, body.to_string()));
        state.comments.entry((format!("{owner}/{name}"), number)).or_default().push(comment);
        Ok(())
    }

    async fn update_comment(&self, _owner: &str, _name: &str, id: u64, body: &str) -> Result<()> {
        let mut state = self.lock();
        state.updated_comments.push((id, body.to_string()));
        for comments in state.comments.values_mut() {
            if let Some(comment) = comments.iter_mut().find(|c| c.id == id) {
                comment.body = body.to_string();
            }
        }
        Ok(())
    }

    async fn delete_comment(&self, _owner: &str, _name: &str, id: u64) -> Result<()> {
        let mut state = self.lock();
        state.deleted_comments.push(id);
        for comments in state.comments.values_mut() {
            comments.retain(|c| c.id != id);
        }
        Ok(())
    }

    async fn list_reviews(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Review>> {
        Ok(self.lock().reviews.get(&(format!("{owner}/{name}"), number)).cloned().unwrap_or_default())
    }

    async fn request_review(
        &self,
        _owner: &str,
        _name: &str,
        _number: u64,
        _logins: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn unrequest_review(
        &self,
        _owner: &str,
        _name: &str,
        _number: u64,
        _logins: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn create_status(
        &self,
        _owner: &str,
        _name: &str,
        sha: &str,
        status: &StatusInput,
    ) -> Result<()> {
        let mut state = self.lock();
        state.created_statuses.push((sha.to_string(), status.clone()));
        let statuses = state.statuses.entry(sha.to_string()).or_default();
        statuses.retain(|s| s.label != status.label);
        statuses.push(CommitStatus {
            state: status.state,
            label: status.label.clone(),
            description: status.description.clone(),
            target: status.target.clone(),
        });
        Ok(())
    }

    async fn list_statuses(
        &self,
        _owner: &str,
        _name: &str,
        sha: &str,
    ) -> Result<Vec<CommitStatus>> {
        Ok(self.lock().statuses.get(sha).cloned().unwrap_or_default())
    }

    async fn list_changes(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Change>> {
        Ok(self.lock().changes.get(&(format!("{owner}/{name}"), number)).cloned().unwrap_or_default())
    }

    async fn add_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()> {
        let mut state = self.lock();
        state.labels_added.push((number, label.to_string()));
        if let Some(pull) = state.pulls.get_mut(&(format!("{owner}/{name}"), number))
            && !pull.has_label(label)
        {
            pull.labels.push(Label { name: label.to_string() });
        }
        Ok(())
    }

    async fn remove_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()> {
        let mut state = self.lock();
        state.labels_removed.push((number, label.to_string()));
        if let Some(pull) = state.pulls.get_mut(&(format!("{owner}/{name}"), number)) {
            pull.labels.retain(|l| l.name != label);
        }
        Ok(())
    }
}

/// Fake [`crate::git::GitClient`] with scripted conflicts.
#[derive(Default)]
pub struct FakeGit {
    /// Head SHAs that fail the dry-run merge.
    pub conflicting: Mutex<Vec<String>>,
}

#[async_trait]
impl crate::git::GitClient for FakeGit {
    fn set_credentials(&self, _user: &str, _token: &str) {}

    async fn merges_cleanly(
        &self,
        _clone_url: &str,
        _base_ref: &str,
        _base_sha: &str,
        head_shas: &[String],
    ) -> Result<bool> {
        let conflicting = self.conflicting.lock().unwrap_or_else(|e| e.into_inner());
        Ok(!head_shas.iter().any(|sha| conflicting.contains(sha)))
    }
}

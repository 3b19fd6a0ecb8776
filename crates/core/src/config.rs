use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level core configuration, loaded from `config.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub report: ReportConfig,
    /// Jobs run against pull requests, keyed by `org/repo`.
    #[serde(default)]
    pub presubmits: BTreeMap<String, Vec<JobDef>>,
    /// Jobs run after merges to a branch, keyed by `org/repo`.
    #[serde(default)]
    pub postsubmits: BTreeMap<String, Vec<JobDef>>,
    #[serde(default)]
    pub keeper: KeeperConfig,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Config> {
        serde_yaml::from_str(text).context("Failed to parse config YAML")
    }

    pub fn presubmits_for(&self, full_name: &str) -> &[JobDef] {
        self.presubmits.get(full_name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn postsubmits_for(&self, full_name: &str) -> &[JobDef] {
        self.postsubmits.get(full_name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether any job is configured for the repository. Used in app-install
    /// mode to reject webhooks from repositories we know nothing about.
    pub fn has_jobs_for(&self, full_name: &str) -> bool {
        !self.presubmits_for(full_name).is_empty() || !self.postsubmits_for(full_name).is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path that accepts webhook POSTs.
    #[serde(default = "default_hook_path")]
    pub hook_path: String,
}

fn default_port() -> u16 { 8080 }

fn default_hook_path() -> String { "/hook".to_string() }

impl Default for ServerConfig {
    fn default() -> Self { Self { port: default_port(), hook_path: default_hook_path() } }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Base URL of the pipeline engine service.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Base URL for commit status target links. Empty disables target URLs.
    #[serde(default)]
    pub url_base: String,
    /// Team segment for target links. Empty falls back to the namespace owner.
    #[serde(default)]
    pub url_team: String,
}

/// A single configured pipeline job.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobDef {
    pub name: String,
    /// Commit status label. Empty defaults to the job name.
    #[serde(default)]
    pub context: String,
    /// Base branches the job applies to. Empty matches every branch.
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub rerun_command: String,
    #[serde(default)]
    pub max_concurrency: u32,
}

impl JobDef {
    pub fn context(&self) -> &str {
        if self.context.is_empty() { &self.name } else { &self.context }
    }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeeperConfig {
    #[serde(default = "default_sync_period")]
    pub sync_period_seconds: u64,
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,
    /// Upper bound on subpools reconciled concurrently within one cycle.
    #[serde(default = "default_max_parallel_subpools")]
    pub max_parallel_subpools: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Blob path for history flushes. Empty disables flushing.
    #[serde(default)]
    pub history_path: String,
    #[serde(default = "default_merge_method")]
    pub merge_method: MergeMethod,
    /// Retry with squash when the repository forbids merge commits.
    #[serde(default)]
    pub squash_fallback: bool,
    /// Labels that raise a PR in subpool ordering. Each match counts once.
    #[serde(default)]
    pub priority_labels: Vec<String>,
    /// Labels a PR must carry to be a merge candidate.
    #[serde(default)]
    pub required_labels: Vec<String>,
    /// Labels that exclude a PR from merging.
    #[serde(default)]
    pub blocking_labels: Vec<String>,
    #[serde(default = "default_conflict_label")]
    pub conflict_label: String,
    #[serde(default = "default_permission_label")]
    pub permission_label: String,
    #[serde(default)]
    pub queries: Vec<KeeperQuery>,
}

fn default_sync_period() -> u64 { 30 }

fn default_batch_size_limit() -> usize { 5 }

fn default_max_parallel_subpools() -> usize { 4 }

fn default_history_limit() -> usize { 1000 }

fn default_merge_method() -> MergeMethod { MergeMethod::Merge }

fn default_conflict_label() -> String { "needs-rebase".to_string() }

fn default_permission_label() -> String { "needs-ok-to-merge".to_string() }

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            sync_period_seconds: default_sync_period(),
            batch_size_limit: default_batch_size_limit(),
            max_parallel_subpools: default_max_parallel_subpools(),
            history_limit: default_history_limit(),
            history_path: String::new(),
            merge_method: default_merge_method(),
            squash_fallback: false,
            priority_labels: Vec::new(),
            required_labels: Vec::new(),
            blocking_labels: Vec::new(),
            conflict_label: default_conflict_label(),
            permission_label: default_permission_label(),
            queries: Vec::new(),
        }
    }
}

impl KeeperConfig {
    /// Labels that exclude a PR, including the conflict label the keeper
    /// applies itself so a conflicted PR stays out until it changes.
    pub fn all_blocking_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.blocking_labels.iter().map(String::as_str).collect();
        if !self.conflict_label.is_empty() && !labels.contains(&self.conflict_label.as_str()) {
            labels.push(&self.conflict_label);
        }
        labels
    }
}

/// One (org, repo) under keeper management.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeeperQuery {
    pub org: String,
    pub repo: String,
    /// Base branches to manage. Empty manages every branch seen on open PRs.
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub required_contexts: Vec<String>,
}

impl KeeperQuery {
    pub fn full_name(&self) -> String { format!("{}/{}", self.org, self.repo) }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }
}

/// Plugin configuration, loaded from `plugins.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Enabled plugin names, keyed by `org/repo` or bare owner.
    #[serde(default)]
    pub plugins: BTreeMap<String, Vec<String>>,
    /// External plugin webhooks, keyed by `org/repo` or bare owner.
    #[serde(default)]
    pub external_plugins: BTreeMap<String, Vec<ExternalPlugin>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExternalPlugin {
    pub name: String,
    /// URL the original webhook payload is re-posted to.
    pub endpoint: String,
    /// Subscribed event names. Empty subscribes to every event.
    #[serde(default)]
    pub events: Vec<String>,
}

impl PluginConfig {
    pub fn from_yaml(text: &str) -> Result<PluginConfig> {
        serde_yaml::from_str(text).context("Failed to parse plugins YAML")
    }

    /// Plugin names enabled for a repository: entries under the repo's full
    /// name plus entries under the bare owner.
    pub fn plugins_for(&self, full_name: &str) -> Vec<&str> {
        let mut names = Vec::new();
        for key in repo_keys(full_name) {
            if let Some(list) = self.plugins.get(key) {
                names.extend(list.iter().map(String::as_str));
            }
        }
        names
    }

    /// External plugins subscribed to `event` for a repository.
    pub fn external_plugins_for(&self, full_name: &str, event: &str) -> Vec<&ExternalPlugin> {
        let mut matched = Vec::new();
        for key in repo_keys(full_name) {
            if let Some(list) = self.external_plugins.get(key) {
                matched.extend(
                    list.iter()
                        .filter(|p| p.events.is_empty() || p.events.iter().any(|e| e == event)),
                );
            }
        }
        matched
    }
}

fn repo_keys(full_name: &str) -> impl Iterator<Item = &str> {
    let owner = full_name.split('/').next().filter(|o| *o != full_name);
    std::iter::once(full_name).chain(owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.hook_path, "/hook");
        assert_eq!(config.keeper.sync_period_seconds, 30);
        assert_eq!(config.keeper.batch_size_limit, 5);
        assert_eq!(config.keeper.history_limit, 1000);
        assert_eq!(config.keeper.merge_method, MergeMethod::Merge);
        assert!(!config.has_jobs_for("foo/bar"));
    }

    #[test]
    fn test_job_defs() {
        let yaml = r#"
presubmits:
  foo/bar:
    - name: unit
      branches: [master]
    - name: lint
      context: code-lint
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let jobs = config.presubmits_for("foo/bar");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].context(), "unit");
        assert!(jobs[0].matches_branch("master"));
        assert!(!jobs[0].matches_branch("develop"));
        assert_eq!(jobs[1].context(), "code-lint");
        assert!(jobs[1].matches_branch("develop"));
        assert!(config.has_jobs_for("foo/bar"));
        assert!(!config.has_jobs_for("foo/other"));
    }

    #[test]
    fn test_plugin_enablement() {
        let yaml = r#"
plugins:
  myorg:
    - trigger
  myorg/special:
    - cat
external_plugins:
  myorg/special:
    - name: size
      endpoint: http://size/hook
      events: [pull_request]
    - name: all-events
      endpoint: http://all/hook
"#;
        let config = PluginConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.plugins_for("myorg/repo"), vec!["trigger"]);
        let mut special = config.plugins_for("myorg/special");
        special.sort();
        assert_eq!(special, vec!["cat", "trigger"]);
        assert!(config.plugins_for("other/repo").is_empty());

        let external = config.external_plugins_for("myorg/special", "pull_request");
        assert_eq!(external.len(), 2);
        let external = config.external_plugins_for("myorg/special", "push");
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].name, "all-events");
    }

    #[test]
    fn test_blocking_labels_include_conflict_label() {
        let keeper = KeeperConfig {
            blocking_labels: vec!["do-not-merge".to_string()],
            ..KeeperConfig::default()
        };
        assert_eq!(keeper.all_blocking_labels(), vec!["do-not-merge", "needs-rebase"]);
    }
}

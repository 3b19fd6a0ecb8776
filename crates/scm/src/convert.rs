//! Conversions from provider types into stored job coordinates.

use lighthouse_core::job::{Pull, Refs};

use crate::types::{PullRequest, Repository};

pub fn pull_from_pr(pr: &PullRequest) -> Pull {
    Pull {
        number: pr.number,
        sha: pr.sha.clone(),
        title: pr.title.clone(),
        pull_ref: format!("pull/{}/head", pr.number),
        link: pr.link.clone(),
        author_login: pr.author.login.clone(),
        commit_link: String::new(),
    }
}

/// Build job refs for `pulls` against `base_ref`/`base_sha` of `repository`.
pub fn refs_for(
    repository: &Repository,
    base_ref: &str,
    base_sha: &str,
    pulls: &[&PullRequest],
) -> Refs {
    Refs {
        org: repository.namespace.clone(),
        repo: repository.name.clone(),
        repo_link: repository.link.clone(),
        base_ref: base_ref.to_string(),
        base_sha: base_sha.to_string(),
        pulls: pulls.iter().map(|pr| pull_from_pr(pr)).collect(),
        clone_url: repository.clone_url.clone(),
    }
}

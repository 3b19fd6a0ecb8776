//! Candidate filtering and deterministic ordering within a subpool.

use std::collections::HashMap;

use lighthouse_core::config::KeeperConfig;
use lighthouse_scm::types::{PullRequest, Review, ReviewState};

/// Drop PRs that cannot merge: missing required labels, carrying blocking
/// labels, conflicted, with a review request still outstanding, or with an
/// outstanding change request.
pub fn filter_candidates(
    config: &KeeperConfig,
    prs: &[PullRequest],
    reviews: &HashMap<u64, Vec<Review>>,
) -> Vec<PullRequest> {
    let blocking = config.all_blocking_labels();
    prs.iter()
        .filter(|pr| config.required_labels.iter().all(|label| pr.has_label(label)))
        .filter(|pr| !blocking.iter().any(|label| pr.has_label(label)))
        .filter(|pr| pr.mergeable != Some(false))
        .filter(|pr| pr.requested_reviewers.is_empty())
        .filter(|pr| !changes_requested(reviews.get(&pr.number).map(Vec::as_slice).unwrap_or(&[])))
        .cloned()
        .collect()
}

/// Whether any reviewer's latest review still requests changes.
fn changes_requested(reviews: &[Review]) -> bool {
    let mut latest: HashMap<&str, &Review> = HashMap::new();
    for review in reviews {
        if review.state == ReviewState::Commented {
            continue;
        }
        let entry = latest.entry(review.author.login.as_str()).or_insert(review);
        if review.submitted >= entry.submitted {
            *entry = review;
        }
    }
    latest.values().any(|review| review.state == ReviewState::ChangesRequested)
}

/// Order candidates: more configured priority labels first, then earlier
/// creation, then higher PR number as the final deterministic tiebreak.
pub fn order_candidates(config: &KeeperConfig, mut prs: Vec<PullRequest>) -> Vec<PullRequest> {
    prs.sort_by(|a, b| {
        priority_count(config, b)
            .cmp(&priority_count(config, a))
            .then_with(|| match (a.created, b.created) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| b.number.cmp(&a.number))
    });
    prs
}

fn priority_count(config: &KeeperConfig, pr: &PullRequest) -> usize {
    config.priority_labels.iter().filter(|label| pr.has_label(label)).count()
}

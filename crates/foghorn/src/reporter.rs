//! PR comment reporting for job state changes.
//!
//! One bot-owned comment per PR carries the latest report; it is found by a
//! marker, updated in place, and surplus marker comments are deleted.

use anyhow::{Context, Result};
use lighthouse_core::job::{Job, JobType};
use lighthouse_scm::ScmProvider;

const REPORT_MARKER: &str = "<!-- lighthouse status report -->";

pub fn format_comment(job: &Job) -> String {
    let state = job
        .status
        .state
        .map(|s| s.as_str())
        .unwrap_or("unknown");
    let mut body = format!(
        "{REPORT_MARKER}\nLighthouse `{}` update: **{}**",
        job.spec.context(),
        state
    );
    if !job.status.description.is_empty() {
        body.push_str(&format!("\n\n{}", job.status.description));
    }
    if !job.status.report_url.is_empty() {
        body.push_str(&format!("\n\n[Details]({})", job.status.report_url));
    }
    if !job.spec.rerun_command.is_empty() {
        body.push_str(&format!("\n\nRerun with `{}`", job.spec.rerun_command));
    }
    body
}

/// Post or refresh the report comment on the job's pull requests. Only
/// presubmit jobs are reported; other types have no PR to comment on.
pub async fn report(scm: &dyn ScmProvider, job: &Job) -> Result<()> {
    if job.spec.job_type != JobType::Presubmit {
        return Ok(());
    }
    let Some(refs) = &job.spec.refs else {
        return Ok(());
    };
    let body = format_comment(job);
    for pull in &refs.pulls {
        let comments = scm
            .list_comments(&refs.org, &refs.repo, pull.number)
            .await
            .context("Failed to list comments")?;
        let mut existing = comments.iter().filter(|c| c.body.contains(REPORT_MARKER));
        if let Some(first) = existing.next() {
            scm.update_comment(&refs.org, &refs.repo, first.id, &body)
                .await
                .context("Failed to update report comment")?;
            for extra in existing {
                if let Err(e) = scm.delete_comment(&refs.org, &refs.repo, extra.id).await {
                    tracing::warn!("Failed to delete stale report comment {}: {e}", extra.id);
                }
            }
        } else {
            scm.create_comment(&refs.org, &refs.repo, pull.number, &body)
                .await
                .context("Failed to create report comment")?;
        }
    }
    Ok(())
}

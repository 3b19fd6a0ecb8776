//! Projection of pipeline activity into provider commit statuses.

use anyhow::{Result, bail};
use lighthouse_core::activity::ActivityRecord;
use lighthouse_core::job::PipelineState;
use lighthouse_scm::types::StatusState;

/// Commit status descriptions are capped at this length by providers.
const MAX_DESCRIPTION_LEN: usize = 63;

pub const DEFAULT_TARGET_TEMPLATE: &str =
    "{BaseURL}/teams/{Team}/projects/{Owner}/{Repository}/{Branch}/{Build}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportInfo {
    pub state: StatusState,
    pub description: String,
}

/// Map an activity to the status and description to report.
///
/// GitLab cannot update a status description without changing state, so
/// running-stage suffixes are suppressed there.
pub fn status_for_activity(activity: &ActivityRecord, scm_kind: &str) -> ReportInfo {
    let (state, description) = match activity.status {
        Some(PipelineState::Success) => (StatusState::Success, "Pipeline successful"),
        Some(PipelineState::Running) | Some(PipelineState::Pending) => {
            (StatusState::Running, "Pipeline running")
        }
        Some(PipelineState::Aborted) => (StatusState::Error, "Error executing pipeline"),
        Some(PipelineState::Failure) => (StatusState::Failure, "Pipeline failed"),
        _ => (StatusState::Unknown, "Pipeline in unknown state"),
    };
    let mut info = ReportInfo { state, description: description.to_string() };
    let running = activity.running_stages();
    if !running.is_empty() && scm_kind != "gitlab" {
        info.description =
            truncate_description(format!("Pipeline running stage(s): {}", running.join(", ")));
    }
    info
}

/// Inputs ≤ 63 bytes pass through; longer ones become `head[..59] + "..."`.
pub fn truncate_description(description: String) -> String {
    if description.len() <= MAX_DESCRIPTION_LEN {
        return description;
    }
    let mut end = MAX_DESCRIPTION_LEN - 4;
    while !description.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &description[..end])
}

/// Parameters available to the target URL template.
#[derive(Debug, Clone, Default)]
pub struct ReportParams {
    pub base_url: String,
    pub team: String,
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub build: String,
    pub context: String,
}

impl ReportParams {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            "BaseURL" => Some(&self.base_url),
            "Team" => Some(&self.team),
            "Owner" => Some(&self.owner),
            "Repository" => Some(&self.repository),
            "Branch" => Some(&self.branch),
            "Build" => Some(&self.build),
            "Context" => Some(&self.context),
            _ => None,
        }
    }
}

/// Render a `{Placeholder}` template. Unknown placeholders are an error, so a
/// typoed template never produces a half-filled URL.
pub fn render_target_url(template: &str, params: &ReportParams) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            bail!("unterminated placeholder in template {template:?}");
        };
        let key = &after[..end];
        let Some(value) = params.get(key) else {
            bail!("unknown placeholder {key:?} in template {template:?}");
        };
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

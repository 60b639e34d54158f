//! Deterministic branch identifiers derived from issue metadata.

/// Placeholder branch-id segment used when title sanitization yields nothing.
/// Kept literal so downstream parsers never see a malformed `type/+{id}` name.
const EMPTY_TITLE_PLACEHOLDER: &str = "<title>";

/// Builds the canonical `{type}/{branch-id}+{issue-id}` branch name.
///
/// When `working_branch_id` is present and non-blank it is trimmed and used
/// verbatim as the branch-id segment; otherwise the issue title is slugged.
/// The function is pure and idempotent; callers must invoke it fresh right
/// before creating the branch or worktree rather than caching the result.
pub fn generate_branch_name(
    issue_id: &str,
    issue_type: &str,
    title: &str,
    working_branch_id: Option<&str>,
) -> String {
    let type_segment = issue_type.trim().to_lowercase();
    let branch_id = match working_branch_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(explicit) => explicit.to_string(),
        None => sanitize_title(title),
    };
    format!("{type_segment}/{branch_id}+{issue_id}")
}

/// Extracts the trailing `+{issue-id}` segment from a generated branch name.
///
/// Returns `None` for any branch that does not match the
/// `{type}/{branch-id}+{issue-id}` shape; a non-matching branch is an
/// expected outcome, not an error.
pub fn parse_issue_id(branch: &str) -> Option<&str> {
    let (prefix, issue_id) = branch.rsplit_once('+')?;
    if issue_id.is_empty() {
        return None;
    }
    let (type_segment, branch_id) = prefix.split_once('/')?;
    if type_segment.is_empty() || branch_id.is_empty() {
        return None;
    }
    Some(issue_id)
}

/// Filesystem-safe directory name for the worktree bound to `branch`.
pub fn worktree_dir_name(branch: &str) -> String {
    branch
        .chars()
        .map(|ch| match ch {
            '/' | '+' | '\\' => '-',
            other => other,
        })
        .collect()
}

fn sanitize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut last_was_hyphen = false;
    for ch in lowered.chars() {
        let mapped = match ch {
            ' ' | '_' => Some('-'),
            'a'..='z' | '0'..='9' | '-' => Some(ch),
            _ => None,
        };
        let Some(mapped) = mapped else {
            continue;
        };
        if mapped == '-' {
            if last_was_hyphen {
                continue;
            }
            last_was_hyphen = true;
        } else {
            last_was_hyphen = false;
        }
        slug.push(mapped);
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        EMPTY_TITLE_PLACEHOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

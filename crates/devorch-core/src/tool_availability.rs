//! Tool-availability evaluation for IssueController's `checkTools` action
//! (spec §4.4).

const BUILTIN_APPS: [&str; 7] = ["file", "code", "search", "browser", "stagehand", "browserbase", "todo.mdx"];

fn app_prefix(tool: &str) -> &str {
    tool.split('.').next().unwrap_or(tool)
}

/// Whether `app` is usable: either one of the built-in apps, or the user
/// has an active connection to it (storage-name form, case-insensitive).
pub fn app_is_usable(app: &str, active_connections: &[String]) -> bool {
    let app_lower = app.to_lowercase();
    BUILTIN_APPS.iter().any(|b| b.eq_ignore_ascii_case(&app_lower))
        || active_connections.iter().any(|c| c.eq_ignore_ascii_case(&app_lower))
}

/// Whether `tool` is covered by `pattern`.
pub fn pattern_matches(pattern: &str, tool: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return app_prefix(tool).eq_ignore_ascii_case(prefix);
    }
    pattern.eq_ignore_ascii_case(tool)
}

pub struct ToolCheckResult {
    pub available: Vec<String>,
    pub missing: Vec<String>,
}

/// Evaluate `required_tools` against an agent's declared `patterns` and the
/// caller's `active_connections`.
pub fn check_tools(
    required_tools: &[String],
    patterns: &[String],
    active_connections: &[String],
) -> ToolCheckResult {
    let mut available = Vec::new();
    let mut missing = Vec::new();

    for tool in required_tools {
        let mut granted = false;
        for pattern in patterns {
            if !pattern_matches(pattern, tool) {
                continue;
            }
            if pattern == "*" {
                granted = true;
                break;
            }
            let app = app_prefix(tool);
            if app_is_usable(app, active_connections) {
                granted = true;
                break;
            }
        }
        if granted {
            available.push(tool.clone());
        } else {
            missing.push(tool.clone());
        }
    }

    ToolCheckResult { available, missing }
}

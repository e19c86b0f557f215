//! Issue graph data model: Issue, Dependency, Label, Comment.
//!
//! Mirrors the Issue table from the persistence kernel bit-for-bit with the
//! backlog line-delimited JSON format, so import/export can round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PRIORITY_LABELS: [&str; 5] = ["P0", "P1", "P2", "P3", "P4"];
pub const ISSUE_TYPES: [&str; 5] = ["bug", "feature", "task", "epic", "chore"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IssueStatus::Open),
            "in_progress" => Some(IssueStatus::InProgress),
            "blocked" => Some(IssueStatus::Blocked),
            "closed" => Some(IssueStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "kebab-case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::ParentChild => "parent-child",
            DependencyType::DiscoveredFrom => "discovered-from",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(DependencyType::Blocks),
            "related" => Some(DependencyType::Related),
            "parent-child" => Some(DependencyType::ParentChild),
            "discovered-from" => Some(DependencyType::DiscoveredFrom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,
    pub depends_on_id: String,
    #[serde(rename = "type")]
    pub dep_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub issue_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

fn clamp_priority(p: i32) -> i32 {
    p.clamp(0, 4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub notes: String,
    pub status: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

fn default_priority() -> i32 {
    2
}

impl Issue {
    pub fn priority_label(&self) -> &'static str {
        PRIORITY_LABELS[clamp_priority(self.priority) as usize]
    }

    /// Build the host label set: user labels plus P0..P4, in-progress/blocked,
    /// and the type label, per the bit-exact label schema.
    pub fn host_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .labels
            .iter()
            .filter(|l| {
                !PRIORITY_LABELS.contains(&l.as_str())
                    && l.as_str() != "in-progress"
                    && l.as_str() != "blocked"
            })
            .cloned()
            .collect();

        labels.push(self.priority_label().to_string());

        match self.status.as_str() {
            "in_progress" => labels.push("in-progress".to_string()),
            "blocked" => labels.push("blocked".to_string()),
            _ => {}
        }

        if ISSUE_TYPES.contains(&self.issue_type.as_str()) {
            labels.push(self.issue_type.clone());
        }

        labels
    }

    /// Parse status/priority back from a host label set plus the host's
    /// native open/closed state, per the "parsing back" rule in §4.3.
    pub fn parse_from_host_labels(host_closed: bool, labels: &[String]) -> (String, i32) {
        let priority = PRIORITY_LABELS
            .iter()
            .position(|p| labels.iter().any(|l| l == p))
            .unwrap_or(2) as i32;

        let status = if host_closed {
            "closed".to_string()
        } else if labels.iter().any(|l| l == "in-progress") {
            "in_progress".to_string()
        } else if labels.iter().any(|l| l == "blocked") {
            "blocked".to_string()
        } else {
            "open".to_string()
        };

        (status, priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_issue() -> Issue {
        Issue {
            id: "todo-a".into(),
            title: "A".into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: "open".into(),
            priority: 2,
            issue_type: "task".into(),
            assignee: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            closed_at: None,
            close_reason: None,
            host_number: None,
            host_id: None,
            last_sync_at: None,
            labels: vec![],
            dependencies: vec![],
        }
    }

    #[test]
    fn priority_label_clamps() {
        let mut issue = sample_issue();
        issue.priority = 9;
        assert_eq!(issue.priority_label(), "P4");
        issue.priority = -3;
        assert_eq!(issue.priority_label(), "P0");
    }

    #[test]
    fn host_labels_adds_priority_status_and_type() {
        let mut issue = sample_issue();
        issue.status = "in_progress".into();
        issue.labels = vec!["custom".into()];
        let labels = issue.host_labels();
        assert!(labels.contains(&"custom".to_string()));
        assert!(labels.contains(&"P2".to_string()));
        assert!(labels.contains(&"in-progress".to_string()));
        assert!(labels.contains(&"task".to_string()));
    }

    #[test]
    fn parse_from_host_labels_round_trips() {
        let labels = vec!["P1".to_string(), "blocked".to_string()];
        let (status, priority) = Issue::parse_from_host_labels(false, &labels);
        assert_eq!(status, "blocked");
        assert_eq!(priority, 1);

        let (status, _) = Issue::parse_from_host_labels(true, &labels);
        assert_eq!(status, "closed");
    }

    #[test]
    fn parse_defaults_to_open_and_p2() {
        let (status, priority) = Issue::parse_from_host_labels(false, &[]);
        assert_eq!(status, "open");
        assert_eq!(priority, 2);
    }
}

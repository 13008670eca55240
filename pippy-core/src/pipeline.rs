//! Pipeline domain types
//!
//! A pipeline is a static, ordered list of stages; each stage points at one
//! GitHub Actions workflow plus its gating and monitoring configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Pipeline definition
///
/// Created once, mutated only by lock/unlock. Deleting a pipeline cascades
/// to all of its runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub locked: bool,
}

/// One stage of a pipeline: a workflow in a repository
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Repository identifier, `org/repo`
    pub repo: String,
    pub workflow: Workflow,
    pub approval: bool,
    #[serde(default, skip_serializing_if = "MonitorInfo::is_empty")]
    pub monitor: MonitorInfo,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input: HashMap<String, String>,
}

impl Stage {
    /// Splits `repo` into its `(org, repo)` halves.
    pub fn org_repo(&self) -> (&str, &str) {
        self.repo.split_once('/').unwrap_or((self.repo.as_str(), ""))
    }
}

/// Workflow descriptor as reported by the CI provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Workflow {
    pub name: String,
    pub url: String,
    pub state: String,
    pub path: String,
    pub id: i64,
}

/// Monitoring configuration for a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorInfo {
    /// Monitor workflow state
    #[serde(default)]
    pub workflow: WorkflowInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datadog: Option<DatadogInfo>,
}

impl MonitorInfo {
    pub fn is_empty(&self) -> bool {
        self.workflow == WorkflowInfo::default() && self.datadog.is_none()
    }
}

/// Workflow-level monitoring: `ignore` overrides a CI failure to success,
/// `rollback` triggers the rollback sub-protocol on failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub rollback: bool,
}

/// External monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatadogInfo {
    pub monitors: Vec<String>,
    pub site: String,
    pub api_key: String,
    pub application_key: String,
    pub rollback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_org_repo() {
        let stage = Stage {
            repo: "org1/repo1".to_string(),
            ..Default::default()
        };
        assert_eq!(stage.org_repo(), ("org1", "repo1"));
    }

    #[test]
    fn test_workflow_field_names() {
        let workflow = Workflow {
            name: "Workflow1".to_string(),
            id: 1234,
            ..Default::default()
        };
        let value = serde_json::to_value(&workflow).unwrap();
        assert_eq!(value["Name"], "Workflow1");
        assert_eq!(value["Id"], 1234);
    }

    #[test]
    fn test_monitor_skipped_when_empty() {
        let stage = Stage {
            repo: "org1/repo1".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&stage).unwrap();
        assert!(value.get("monitor").is_none());
        assert!(value.get("input").is_none());
    }
}

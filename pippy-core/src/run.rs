//! Pipeline run types
//!
//! A pipeline run is the durable state of one execution: a top-level state
//! plus one StageRun per stage, aligned by index with the pipeline's stages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level state of a pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Success,
    Failed,
    InProgress,
    PendingApproval,
    Paused,
    Rollback,
    ConcurrentError,
    Canceled,
    Locked,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Unknown => "",
            RunState::Success => "Success",
            RunState::Failed => "Failed",
            RunState::InProgress => "InProgress",
            RunState::PendingApproval => "PendingApproval",
            RunState::Paused => "Paused",
            RunState::Rollback => "Rollback",
            RunState::ConcurrentError => "ConcurrentError",
            RunState::Canceled => "Canceled",
            RunState::Locked => "Locked",
        };
        f.write_str(s)
    }
}

/// Per-stage sub-state within a run
///
/// A new stage starts empty, moves through the CI-level outcomes
/// (`Workflow_*`) and settles on a terminal state once the monitoring
/// window has decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    #[default]
    #[serde(rename = "")]
    New,
    #[serde(rename = "Workflow_Unknown")]
    WorkflowUnknown,
    PendingApproval,
    InProgress,
    #[serde(rename = "Workflow_Success")]
    WorkflowSuccess,
    #[serde(rename = "Workflow_Failed")]
    WorkflowFailed,
    Success,
    Failed,
    ConcurrentError,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Success | StageState::Failed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::New => "",
            StageState::WorkflowUnknown => "Workflow_Unknown",
            StageState::PendingApproval => "PendingApproval",
            StageState::InProgress => "InProgress",
            StageState::WorkflowSuccess => "Workflow_Success",
            StageState::WorkflowFailed => "Workflow_Failed",
            StageState::Success => "Success",
            StageState::Failed => "Failed",
            StageState::ConcurrentError => "ConcurrentError",
        };
        f.write_str(s)
    }
}

/// Actor that approved a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRunApproval {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl StageRunApproval {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.login.is_empty() && self.email.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRunMetadata {
    #[serde(default)]
    pub approval: StageRunApproval,
}

/// Who triggered the run and why
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub name: String,
    pub login: String,
    pub email: String,
    pub reason: String,
}

/// Durable per-stage record of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub name: String,
    #[serde(default)]
    pub state: StageState,
    pub url: String,
    /// Opaque token matched against the CI run display title
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    pub title: String,
    pub reason: String,
    #[serde(default)]
    pub input: HashMap<String, String>,
    /// Shadow run while the rollback sub-protocol is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Box<StageRun>>,
    #[serde(default)]
    pub metadata: StageRunMetadata,
    #[serde(rename = "concurrent", default)]
    pub concurrent_run_id: String,
}

/// Durable state of one pipeline execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    #[serde(rename = "name")]
    pub pipeline_name: String,
    #[serde(default)]
    pub stages: Vec<StageRun>,
    #[serde(default)]
    pub state: RunState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(rename = "input", default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub paused: bool,
    /// Current target version, normally the run id
    #[serde(default)]
    pub version: String,
    #[serde(rename = "trigger_metadata", default)]
    pub trigger: TriggerMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_round_trip() {
        for state in [
            StageState::New,
            StageState::WorkflowUnknown,
            StageState::WorkflowSuccess,
            StageState::WorkflowFailed,
            StageState::InProgress,
            StageState::Success,
            StageState::Failed,
            StageState::ConcurrentError,
        ] {
            let value = serde_json::to_string(&state).unwrap();
            let back: StageState = serde_json::from_str(&value).unwrap();
            assert_eq!(state, back);
            assert_eq!(value, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_pipeline_run_field_names() {
        let run = PipelineRun {
            id: "run-1".to_string(),
            pipeline_name: "Pipeline1".to_string(),
            created: Utc::now(),
            updated: Utc::now(),
            ..Default::default()
        };
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["name"], "Pipeline1");
        assert_eq!(value["state"], "");
        assert!(value.get("input").is_some());
        assert!(value.get("trigger_metadata").is_some());
    }

    #[test]
    fn test_stage_run_concurrent_field_name() {
        let stage_run = StageRun {
            name: "Workflow1".to_string(),
            concurrent_run_id: "other-run".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&stage_run).unwrap();
        assert_eq!(value["concurrent"], "other-run");
        assert!(value.get("rollback").is_none());
    }
}

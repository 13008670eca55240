//! GitHub API item types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    /// Full name, `org/repo`
    pub name: String,
    pub url: String,
    pub detail: String,
}

/// Organization summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Org {
    pub name: String,
    pub login: String,
    pub url: String,
    pub company: String,
    pub avatar_url: String,
    pub id: i64,
}

/// One workflow run as observed from the CI provider
///
/// `name` is the run's display title; the orchestrator matches it against
/// the stage run id the dispatcher embedded via `pippy_run_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub name: String,
    pub url: String,
    pub id: i64,
    pub status: String,
    pub workflow_id: i64,
    pub conclusion: String,
    pub run_started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

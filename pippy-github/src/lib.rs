//! GitHub client for pippy
//!
//! Everything the orchestrator needs from the CI provider lives behind the
//! [`Client`] trait: listing repos, orgs and workflows, observing workflow
//! runs, dispatching new runs, and checking that a workflow file is
//! pippy-ready. [`GithubClient`] implements it against the GitHub REST API;
//! the test suites substitute in-memory stubs.

pub mod auth;
mod client;
mod error;
mod types;
mod validate;

use std::collections::HashMap;

use async_trait::async_trait;

pub use client::GithubClient;
pub use error::{GithubError, Result};
pub use types::{Org, Repo, WorkflowRun};

use pippy_core::Workflow;

/// Capability set the core consumes from the CI provider.
#[async_trait]
pub trait Client: Send + Sync {
    /// Repositories visible to the authenticated user, filtered by type
    /// (`all`, `owner`, `public`, `private`, `member`).
    async fn list_repos(&self, repo_type: &str) -> Result<Vec<Repo>>;

    async fn get_workflow(&self, org: &str, repo: &str, id: i64) -> Result<Workflow>;

    async fn list_workflows(&self, org: &str, repo: &str) -> Result<Vec<Workflow>>;

    /// Workflow runs for `workflow_id`, filtered to `workflow_dispatch`
    /// events created within the `created` window (`">=<RFC3339>"`).
    async fn list_workflow_runs(
        &self,
        org: &str,
        repo: &str,
        workflow_id: i64,
        created: &str,
    ) -> Result<Vec<WorkflowRun>>;

    /// Trigger a new run of `workflow_id` on `git_ref` with `inputs`.
    async fn create_workflow_dispatch(
        &self,
        org: &str,
        repo: &str,
        workflow_id: i64,
        git_ref: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<()>;

    /// YAML fragments that must be added to make the workflow pippy-ready,
    /// plus the workflow's declared dispatch inputs.
    async fn validate_workflow(
        &self,
        org: &str,
        repo: &str,
        path: &str,
    ) -> Result<(Vec<String>, HashMap<String, String>)>;

    /// The original workflow file and a fully rewritten pippy-ready copy.
    async fn validate_workflow_full(
        &self,
        org: &str,
        repo: &str,
        path: &str,
    ) -> Result<(String, String)>;

    async fn list_orgs_for_user(&self) -> Result<Vec<Org>>;
}

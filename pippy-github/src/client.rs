//! GitHub REST implementation of the [`Client`] trait

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use pippy_core::Workflow;

use crate::auth;
use crate::types::{Org, Repo, WorkflowRun};
use crate::validate;
use crate::{Client, GithubError, Result};

const API_BASE: &str = "https://api.github.com";

/// Client against the GitHub REST API, authenticated with the cached
/// access token (logging the user in when no token is cached).
pub struct GithubClient {
    http: reqwest::Client,
    /// Fixed token override; when empty the cached token is used.
    access_token: Option<String>,
    api_base: String,
}

impl Default for GithubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GithubClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token: None,
            api_base: API_BASE.to_string(),
        }
    }

    /// Use a fixed token instead of the cached credentials.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Self::new()
        }
    }

    /// Point the client at a different API host (tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn token(&self) -> Result<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => auth::get_cached_access_token().await,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.token().await?;
        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .query(query)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "pippy")
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::api(status.as_u16(), response.text().await?));
        }
        Ok(response.json().await?)
    }

    async fn get_contents(&self, org: &str, repo: &str, path: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Contents {
            content: String,
        }

        let contents: Contents = self
            .get_json(&format!("/repos/{org}/{repo}/contents/{path}"), &[])
            .await?;
        // GitHub wraps base64 content across lines
        let packed: String = contents.content.split_whitespace().collect();
        let decoded = STANDARD
            .decode(packed)
            .map_err(|err| GithubError::Content(err.to_string()))?;
        String::from_utf8(decoded).map_err(|err| GithubError::Content(err.to_string()))
    }
}

#[derive(Deserialize)]
struct ApiWorkflow {
    id: i64,
    name: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    path: String,
}

impl From<ApiWorkflow> for Workflow {
    fn from(workflow: ApiWorkflow) -> Self {
        Workflow {
            name: workflow.name,
            url: workflow.html_url,
            state: workflow.state,
            path: workflow.path,
            id: workflow.id,
        }
    }
}

#[derive(Deserialize)]
struct ApiWorkflowRun {
    id: i64,
    #[serde(default)]
    display_title: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    workflow_id: i64,
    #[serde(default)]
    run_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl Client for GithubClient {
    async fn list_repos(&self, repo_type: &str) -> Result<Vec<Repo>> {
        #[derive(Deserialize)]
        struct ApiRepo {
            full_name: String,
            #[serde(default)]
            html_url: String,
            #[serde(default)]
            description: Option<String>,
        }

        let repos: Vec<ApiRepo> = self
            .get_json("/user/repos", &[("type", repo_type.to_string())])
            .await?;
        Ok(repos
            .into_iter()
            .map(|repo| Repo {
                name: repo.full_name,
                url: repo.html_url,
                detail: repo.description.unwrap_or_default(),
            })
            .collect())
    }

    async fn get_workflow(&self, org: &str, repo: &str, id: i64) -> Result<Workflow> {
        let workflow: ApiWorkflow = self
            .get_json(&format!("/repos/{org}/{repo}/actions/workflows/{id}"), &[])
            .await?;
        Ok(workflow.into())
    }

    async fn list_workflows(&self, org: &str, repo: &str) -> Result<Vec<Workflow>> {
        #[derive(Deserialize)]
        struct Workflows {
            workflows: Vec<ApiWorkflow>,
        }

        let listing: Workflows = self
            .get_json(&format!("/repos/{org}/{repo}/actions/workflows"), &[])
            .await?;
        Ok(listing.workflows.into_iter().map(Into::into).collect())
    }

    async fn list_workflow_runs(
        &self,
        org: &str,
        repo: &str,
        workflow_id: i64,
        created: &str,
    ) -> Result<Vec<WorkflowRun>> {
        #[derive(Deserialize)]
        struct WorkflowRuns {
            workflow_runs: Vec<ApiWorkflowRun>,
        }

        let listing: WorkflowRuns = self
            .get_json(
                &format!("/repos/{org}/{repo}/actions/workflows/{workflow_id}/runs"),
                &[
                    ("event", "workflow_dispatch".to_string()),
                    ("created", created.to_string()),
                ],
            )
            .await?;

        Ok(listing
            .workflow_runs
            .into_iter()
            .map(|run| WorkflowRun {
                name: run.display_title,
                url: run.html_url,
                id: run.id,
                status: run.status,
                workflow_id: run.workflow_id,
                conclusion: run.conclusion.unwrap_or_default(),
                run_started_at: run.run_started_at,
                updated_at: run.updated_at,
            })
            .collect())
    }

    async fn create_workflow_dispatch(
        &self,
        org: &str,
        repo: &str,
        workflow_id: i64,
        git_ref: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<()> {
        let token = self.token().await?;
        let response = self
            .http
            .post(format!(
                "{}/repos/{org}/{repo}/actions/workflows/{workflow_id}/dispatches",
                self.api_base
            ))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "pippy")
            .bearer_auth(token)
            .json(&json!({"ref": git_ref, "inputs": inputs}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::api(
                status.as_u16(),
                format!("workflow create run dispatch returned error: {}", response.text().await?),
            ));
        }
        Ok(())
    }

    async fn validate_workflow(
        &self,
        org: &str,
        repo: &str,
        path: &str,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        let content = self.get_contents(org, repo, path).await?;
        validate::required_changes(&content)
    }

    async fn validate_workflow_full(
        &self,
        org: &str,
        repo: &str,
        path: &str,
    ) -> Result<(String, String)> {
        let content = self.get_contents(org, repo, path).await?;
        let rewritten = validate::rewrite(&content)?;
        Ok((content, rewritten))
    }

    async fn list_orgs_for_user(&self) -> Result<Vec<Org>> {
        #[derive(Deserialize)]
        struct ApiOrg {
            #[serde(default)]
            name: Option<String>,
            login: String,
            #[serde(default)]
            url: String,
            #[serde(default)]
            company: Option<String>,
            #[serde(default)]
            avatar_url: String,
            id: i64,
        }

        let orgs: Vec<ApiOrg> = self.get_json("/user/orgs", &[]).await?;
        Ok(orgs
            .into_iter()
            .map(|org| Org {
                name: org.name.unwrap_or_default(),
                login: org.login,
                url: org.url,
                company: org.company.unwrap_or_default(),
                avatar_url: org.avatar_url,
                id: org.id,
            })
            .collect())
    }
}

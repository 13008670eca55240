//! Workflow command handlers

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;

use pippy_github::{Client, GithubClient};

use super::REPO_TYPES;

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// List workflows for a repo
    List {
        /// Repository, `org/repo`; omit to list candidate repos instead
        #[arg(long)]
        repo: Option<String>,

        /// Repo type used when listing candidate repos
        #[arg(long, default_value = "owner", value_parser = REPO_TYPES)]
        r#type: String,
    },
    /// Check that workflows are configured for pippy to function correctly
    Validate {
        /// Repository, `org/repo`
        #[arg(long)]
        repo: String,

        /// Workflow name or numeric id; omit to validate every workflow
        #[arg(long)]
        workflow: Option<String>,

        /// Print the fully rewritten workflow file instead of fragments
        #[arg(long, default_value_t = false)]
        full: bool,
    },
}

pub async fn handle(command: WorkflowCommands) -> Result<()> {
    match command {
        WorkflowCommands::List { repo, r#type } => list(repo.as_deref(), &r#type).await,
        WorkflowCommands::Validate {
            repo,
            workflow,
            full,
        } => validate(&repo, workflow.as_deref(), full).await,
    }
}

fn split_repo(org_repo: &str) -> Result<(&str, &str)> {
    org_repo
        .split_once('/')
        .context("repository must be provided as org/repo")
}

async fn list(repo: Option<&str>, repo_type: &str) -> Result<()> {
    let client = GithubClient::new();

    let Some(org_repo) = repo else {
        println!("{}", "Choose a repo and re-run with --repo:".bold());
        for repo in client.list_repos(repo_type).await? {
            println!("  {} {}", "▸".cyan(), repo.name);
        }
        return Ok(());
    };

    let (org, repo) = split_repo(org_repo)?;
    let workflows = client.list_workflows(org, repo).await?;

    if workflows.is_empty() {
        println!("{}", "No workflows found.".yellow());
        return Ok(());
    }

    for workflow in workflows {
        println!("  {} {}", "▸".cyan(), workflow.name.bold());
        println!("    Id:    {}", workflow.id.to_string().dimmed());
        println!("    Path:  {}", workflow.path.dimmed());
        println!("    State: {}", workflow.state.dimmed());
    }
    Ok(())
}

async fn validate(org_repo: &str, selector: Option<&str>, full: bool) -> Result<()> {
    let client = GithubClient::new();
    let (org, repo) = split_repo(org_repo)?;

    let workflows = client.list_workflows(org, repo).await?;
    let selected: Vec<_> = match selector {
        Some(selector) => {
            let matched: Vec<_> = workflows
                .into_iter()
                .filter(|workflow| {
                    workflow.name.eq_ignore_ascii_case(selector)
                        || workflow.id.to_string() == selector
                })
                .collect();
            if matched.is_empty() {
                bail!("workflow {selector} not found in {org_repo}");
            }
            matched
        }
        None => workflows,
    };

    for workflow in selected {
        if full {
            let (_, rewritten) = client
                .validate_workflow_full(org, repo, &workflow.path)
                .await?;
            println!("{}", format!("# {} ({})", workflow.name, workflow.path).bold());
            println!("{rewritten}");
            continue;
        }

        let (changes, _) = client.validate_workflow(org, repo, &workflow.path).await?;
        if changes.is_empty() {
            println!("{} {} is pippy ready", "✓".green(), workflow.name.bold());
            continue;
        }

        println!(
            "{} {} needs the following additions:",
            "✗".red(),
            workflow.name.bold()
        );
        for change in changes {
            println!("{}", change.dimmed());
        }
    }
    Ok(())
}

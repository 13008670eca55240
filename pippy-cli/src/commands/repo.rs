//! Repo command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use pippy_github::{Client, GithubClient};

use super::REPO_TYPES;

#[derive(Subcommand)]
pub enum RepoCommands {
    /// List repositories for the logged in user
    List {
        /// Repo type
        #[arg(long, default_value = "owner", value_parser = REPO_TYPES)]
        r#type: String,
    },
}

pub async fn handle(command: RepoCommands) -> Result<()> {
    match command {
        RepoCommands::List { r#type } => list(&r#type).await,
    }
}

async fn list(repo_type: &str) -> Result<()> {
    let client = GithubClient::new();
    let repos = client.list_repos(repo_type).await?;

    if repos.is_empty() {
        println!("{}", "No repositories found.".yellow());
        return Ok(());
    }

    for repo in repos {
        println!("  {} {}", "▸".cyan(), repo.name.bold());
        if !repo.detail.is_empty() {
            println!("    {}", repo.detail.dimmed());
        }
    }
    Ok(())
}

//! Org command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use pippy_github::{Client, GithubClient};

#[derive(Subcommand)]
pub enum OrgCommands {
    /// List organizations for the logged in user
    List,
}

pub async fn handle(command: OrgCommands) -> Result<()> {
    match command {
        OrgCommands::List => list().await,
    }
}

async fn list() -> Result<()> {
    let client = GithubClient::new();
    let orgs = client.list_orgs_for_user().await?;

    if orgs.is_empty() {
        println!("{}", "No organizations found.".yellow());
        return Ok(());
    }

    for org in orgs {
        println!("  {} {}", "▸".cyan(), org.login.bold());
        if !org.name.is_empty() {
            println!("    Name:    {}", org.name.dimmed());
        }
        if !org.company.is_empty() {
            println!("    Company: {}", org.company.dimmed());
        }
    }
    Ok(())
}

//! Command handlers
//!
//! One module per top-level command, routed from [`handle_command`].

mod audit;
mod org;
mod pipeline;
mod repo;
mod user;
mod workflow;

use anyhow::Result;
use clap::Subcommand;

use pippy_orchestrator::Actor;

pub const REPO_TYPES: [&str; 5] = ["all", "owner", "public", "private", "member"];

#[derive(Subcommand)]
pub enum Commands {
    /// User management
    #[command(subcommand)]
    User(user::UserCommands),
    /// Organization lookups
    #[command(subcommand)]
    Org(org::OrgCommands),
    /// Repository lookups
    #[command(subcommand)]
    Repo(repo::RepoCommands),
    /// Workflow management
    #[command(subcommand)]
    Workflow(workflow::WorkflowCommands),
    /// Pipeline management
    #[command(subcommand)]
    Pipeline(pipeline::PipelineCommands),
    /// Audit management
    #[command(subcommand)]
    Audit(audit::AuditCommands),
}

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::User(command) => user::handle(command).await,
        Commands::Org(command) => org::handle(command).await,
        Commands::Repo(command) => repo::handle(command).await,
        Commands::Workflow(command) => workflow::handle(command).await,
        Commands::Pipeline(command) => pipeline::handle(command).await,
        Commands::Audit(command) => audit::handle(command).await,
    }
}

/// Resolve the acting user from the cached credentials, logging in first
/// when nothing is cached.
pub async fn current_actor() -> Result<(Actor, pippy_github::auth::UserStore)> {
    let tokens = pippy_github::auth::login_user().await?;
    let actor = Actor {
        name: tokens.github_user.login.clone(),
        email: tokens.github_user.email.clone(),
    };
    Ok((actor, tokens))
}

/// Parse `key=value` pairs; a missing `=` yields an empty value.
pub fn parse_key_value_pairs(pairs: &[String]) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_pairs() {
        let pairs = vec![
            "version=44ffae".to_string(),
            "description=detailed here".to_string(),
            "flag".to_string(),
            "eq=a=b".to_string(),
        ];
        let parsed = parse_key_value_pairs(&pairs);
        assert_eq!(parsed.get("version"), Some(&"44ffae".to_string()));
        assert_eq!(parsed.get("description"), Some(&"detailed here".to_string()));
        assert_eq!(parsed.get("flag"), Some(&String::new()));
        assert_eq!(parsed.get("eq"), Some(&"a=b".to_string()));
    }
}

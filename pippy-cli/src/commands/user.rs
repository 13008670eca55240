//! User command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

#[derive(Subcommand)]
pub enum UserCommands {
    /// Login user
    Login,
}

pub async fn handle(command: UserCommands) -> Result<()> {
    match command {
        UserCommands::Login => login().await,
    }
}

async fn login() -> Result<()> {
    let tokens = pippy_github::auth::login_user().await?;
    let user = &tokens.github_user;
    println!(
        "{} Logged in as {} {}",
        "✓".green(),
        user.login.bold(),
        format!("({})", user.email).dimmed()
    );
    Ok(())
}

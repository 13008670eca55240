//! Audit command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use crate::output;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List audit records, newest first
    List {
        /// Audit list limit
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

pub async fn handle(command: AuditCommands) -> Result<()> {
    match command {
        AuditCommands::List { limit } => list(limit).await,
    }
}

async fn list(limit: i64) -> Result<()> {
    let audits = pippy_orchestrator::audit::list(limit).await?;
    if audits.is_empty() {
        println!("{}", "No audit records found.".yellow());
        return Ok(());
    }
    output::print_audits(&audits);
    Ok(())
}

//! pippy CLI
//!
//! Command-line interface for chaining GitHub Actions workflows into
//! release pipelines with approval gates, monitoring and rollback.

mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use commands::{handle_command, Commands};

#[derive(Parser)]
#[command(name = "pippy")]
#[command(version, about = "pippy interacts with github actions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = pippy_store::home_dir().ok()?.join(".pippy").join("logs");

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("pippy")
        .filename_suffix("log")
        .max_log_files(7)
        .build(logs_dir)
        .ok()?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pippy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging();

    let cli = Cli::parse();
    handle_command(cli.command).await
}

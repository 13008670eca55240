//! Pipeline command handlers
//!
//! Pipelines are created from a stage-list file (workflow references are
//! resolved and validated against the repo), then driven through the run
//! subcommands: execute, list, show, approve, cancel, pause and resume.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Deserialize;

use pippy_core::audit::AUDIT_PAUSED;
use pippy_core::{DatadogInfo, MonitorInfo, Stage, TriggerMetadata, WorkflowInfo};
use pippy_github::{Client, GithubClient};
use pippy_orchestrator::{approve, create_orchestrator, lock, pause, pipelines, runs};

use super::{current_actor, parse_key_value_pairs, REPO_TYPES};
use crate::output;

#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Create a pipeline from workflows across single or multiple repos
    Create {
        /// Pipeline name
        #[arg(long)]
        name: String,

        /// Path to a JSON file holding the stage list
        #[arg(long)]
        file: String,

        /// Repo type checked when resolving workflows
        #[arg(long, default_value = "owner", value_parser = REPO_TYPES)]
        r#type: String,
    },
    /// List pipelines already saved
    List,
    /// Show a pipeline already saved
    Show {
        #[arg(long)]
        name: String,
    },
    /// Delete a pipeline already saved
    Delete {
        #[arg(long)]
        name: String,
    },
    /// Lock a pipeline to deny all approvals
    Lock {
        #[arg(long)]
        name: String,

        /// Lock reason
        #[arg(long)]
        reason: String,
    },
    /// Unlock a pipeline to allow approvals again
    Unlock {
        #[arg(long)]
        name: String,

        /// Unlock reason
        #[arg(long)]
        reason: String,
    },
    /// Pipeline runs
    #[command(subcommand)]
    Run(RunCommands),
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Run a pipeline
    Execute {
        #[arg(long)]
        name: String,

        /// Pipeline run id to resume, blank for a new run
        #[arg(long, default_value = "")]
        id: String,

        /// Pipeline input provided as kv pair, --input version=44ffae
        #[arg(long)]
        input: Vec<String>,

        /// Use with caution: force the current version to run even when
        /// another rollout is ongoing
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show pipeline runs
    List {
        #[arg(long)]
        name: String,

        /// Latest n pipeline runs, -1/0 for all
        #[arg(long, default_value_t = 10)]
        count: i64,
    },
    /// Show pipeline run details
    Show {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,
    },
    /// Approve pipeline run stages pending approval
    Approve {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,

        /// Stage number to approve; repeat for several, omit for all
        #[arg(long)]
        stage: Vec<i64>,
    },
    /// Cancel approval of pipeline run for approved stages
    Cancel {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,

        /// Stage number to cancel; repeat for several, omit for all
        #[arg(long)]
        stage: Vec<i64>,
    },
    /// Pause a pipeline run
    Pause {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,

        /// Pause reason
        #[arg(long)]
        reason: String,
    },
    /// Resume a pipeline run
    Resume {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,

        /// Resume reason
        #[arg(long)]
        reason: String,
    },
}

pub async fn handle(command: PipelineCommands) -> Result<()> {
    match command {
        PipelineCommands::Create { name, file, r#type } => create(&name, &file, &r#type).await,
        PipelineCommands::List => list().await,
        PipelineCommands::Show { name } => show(&name).await,
        PipelineCommands::Delete { name } => delete(&name).await,
        PipelineCommands::Lock { name, reason } => set_lock(&name, &reason, true).await,
        PipelineCommands::Unlock { name, reason } => set_lock(&name, &reason, false).await,
        PipelineCommands::Run(command) => handle_run(command).await,
    }
}

async fn handle_run(command: RunCommands) -> Result<()> {
    match command {
        RunCommands::Execute {
            name,
            id,
            input,
            force,
        } => execute(&name, &id, &input, force).await,
        RunCommands::List { name, count } => list_runs(&name, count).await,
        RunCommands::Show { name, id } => show_run(&name, &id).await,
        RunCommands::Approve { name, id, stage } => approve_run(&name, &id, &stage).await,
        RunCommands::Cancel { name, id, stage } => cancel_approval(&name, &id, &stage).await,
        RunCommands::Pause { name, id, reason } => pause_run(&name, &id, &reason).await,
        RunCommands::Resume { name, id, reason } => resume_run(&name, &id, &reason).await,
    }
}

/// One stage as written in the `--file` stage list.
#[derive(Debug, Deserialize)]
struct StageSpec {
    repo: String,
    workflow: WorkflowSelector,
    #[serde(default)]
    approval: bool,
    #[serde(default)]
    ignore: bool,
    #[serde(default)]
    rollback: bool,
    #[serde(default)]
    datadog: Option<DatadogInfo>,
    #[serde(default)]
    input: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorkflowSelector {
    Id(i64),
    Name(String),
}

async fn resolve_stage(client: &GithubClient, spec: StageSpec) -> Result<Stage> {
    let (org, repo) = spec
        .repo
        .split_once('/')
        .context("stage repo must be provided as org/repo")?;

    let workflows = client.list_workflows(org, repo).await?;
    let workflow = workflows
        .into_iter()
        .find(|workflow| match &spec.workflow {
            WorkflowSelector::Id(id) => workflow.id == *id,
            WorkflowSelector::Name(name) => workflow.name.eq_ignore_ascii_case(name),
        })
        .with_context(|| format!("workflow not found in {}", spec.repo))?;

    Ok(Stage {
        repo: spec.repo,
        workflow,
        approval: spec.approval,
        monitor: MonitorInfo {
            workflow: WorkflowInfo {
                ignore: spec.ignore,
                rollback: spec.rollback,
            },
            datadog: spec.datadog,
        },
        input: spec.input,
    })
}

async fn create(name: &str, file: &str, _repo_type: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read stage file: {file}"))?;
    let specs: Vec<StageSpec> =
        serde_json::from_str(&content).context("Failed to parse stage file")?;
    if specs.is_empty() {
        bail!("stage file defines no stages");
    }

    let client = GithubClient::new();
    let mut stages = Vec::new();
    for spec in specs {
        stages.push(resolve_stage(&client, spec).await?);
    }

    let pipeline = pipelines::create_pipeline(name, stages, &client).await?;

    println!("{}", "✓ Pipeline created successfully!".green().bold());
    output::print_pipeline(&pipeline);
    Ok(())
}

async fn list() -> Result<()> {
    let pipelines = pipelines::list_pipelines().await?;
    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} pipeline(s):", pipelines.len()).bold());
    println!();
    for pipeline in pipelines {
        output::print_pipeline_summary(&pipeline);
    }
    Ok(())
}

async fn show(name: &str) -> Result<()> {
    match pipelines::get_pipeline(name).await {
        Ok(pipeline) => {
            output::print_pipeline(&pipeline);
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            println!(
                "{} pipeline {} not found",
                "✗".red(),
                name.yellow()
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn delete(name: &str) -> Result<()> {
    pipelines::delete_pipeline(name).await?;
    println!("{} {}", "✓".green(), "Successfully deleted pipeline".bold());
    Ok(())
}

async fn set_lock(name: &str, reason: &str, locked: bool) -> Result<()> {
    let (actor, _) = current_actor().await?;
    if locked {
        lock::lock_pipeline(name, reason, &actor).await?;
        println!("{} {}", "✓".green(), "Successfully locked pipeline".bold());
    } else {
        lock::unlock_pipeline(name, reason, &actor).await?;
        println!("{} {}", "✓".green(), "Successfully unlocked pipeline".bold());
    }
    Ok(())
}

async fn execute(name: &str, id: &str, input: &[String], force: bool) -> Result<()> {
    let (_, tokens) = current_actor().await?;
    let user = &tokens.github_user;
    let trigger = TriggerMetadata {
        name: user.name.clone(),
        login: user.login.clone(),
        email: user.email.clone(),
        reason: "Manual run".to_string(),
    };

    let inputs = parse_key_value_pairs(input);

    let mut orchestrator =
        create_orchestrator(name, id, inputs, None, trigger, force).await?;

    let state = orchestrator.status().get_state();
    if state == pippy_core::RunState::Success || state == pippy_core::RunState::Failed {
        println!(
            "{} run {} already completed with state {}",
            "✗".yellow(),
            orchestrator.run_id().dimmed(),
            state.to_string().bold()
        );
        return Ok(());
    }

    println!(
        "{} pipeline {} run {}",
        "▸".cyan(),
        name.bold(),
        orchestrator.run_id().dimmed()
    );

    // ctrl-c stops the loop after the current tick and a final checkpoint
    let stopper = orchestrator.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.notify_one();
        }
    });

    let run_id = orchestrator.run_id().to_string();
    orchestrator.orchestrate(5000).await?;

    let run = runs::get_pipeline_run(name, &run_id).await?;
    output::print_run(name, &run);
    Ok(())
}

async fn list_runs(name: &str, count: i64) -> Result<()> {
    let runs = runs::get_pipeline_runs_n(name, count).await?;
    if runs.is_empty() {
        println!("{}", "No pipeline runs found.".yellow());
        return Ok(());
    }
    output::print_runs(&runs);
    Ok(())
}

async fn show_run(name: &str, id: &str) -> Result<()> {
    match runs::get_pipeline_run(name, id).await {
        Ok(run) => {
            output::print_run(name, &run);
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            println!(
                "{} pipeline run {} for pipeline {} not found",
                "✗".red(),
                id.yellow(),
                name.yellow()
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn approve_run(name: &str, id: &str, stages: &[i64]) -> Result<()> {
    let (actor, _) = current_actor().await?;
    let pipeline = pipelines::get_pipeline(name).await?;
    let run = runs::get_pipeline_run(name, id).await?;

    let pending = approve::pending_approvals(&pipeline, &run);
    if pending.is_empty() {
        println!(
            "No pending approvals for pipeline {} with run id {}",
            name.bold(),
            id.dimmed()
        );
        return Ok(());
    }

    let selected: Vec<i64> = if stages.is_empty() {
        pending.iter().map(|(i, _, _)| *i as i64).collect()
    } else {
        stages.to_vec()
    };

    for stage_num in selected {
        approve::approve_pipeline_run(name, id, stage_num, &actor).await?;
        println!(
            "{} Stage {} approved by {}({})",
            "✓".green(),
            stage_num + 1,
            actor.name,
            actor.email
        );
    }
    Ok(())
}

async fn cancel_approval(name: &str, id: &str, stages: &[i64]) -> Result<()> {
    let (actor, _) = current_actor().await?;
    let pipeline = pipelines::get_pipeline(name).await?;
    let run = runs::get_pipeline_run(name, id).await?;

    let cancelable = approve::cancelable_approvals(&pipeline, &run);
    if cancelable.is_empty() {
        println!(
            "No approved stages for pipeline {} with run id {}",
            name.bold(),
            id.dimmed()
        );
        return Ok(());
    }

    if stages.is_empty() {
        let selected: Vec<usize> = cancelable.iter().map(|(i, _, _)| *i).collect();
        approve::cancel_approvals(name, id, &selected, &actor).await?;
        for stage_num in selected {
            println!("{} Stage {} canceled approval", "✓".green(), stage_num + 1);
        }
        return Ok(());
    }

    for stage_num in stages.iter().copied() {
        approve::cancel_approve_pipeline_run(name, id, stage_num, &actor).await?;
        println!("{} Stage {} canceled approval", "✓".green(), stage_num + 1);
    }
    Ok(())
}

async fn pause_run(name: &str, id: &str, reason: &str) -> Result<()> {
    let (actor, _) = current_actor().await?;
    pause::pause_pipeline_run(name, id, reason, &actor).await?;
    println!("{} {}", "✓".green(), "Successfully paused pipeline".bold());
    Ok(())
}

async fn resume_run(name: &str, id: &str, reason: &str) -> Result<()> {
    let (actor, _) = current_actor().await?;

    let resource = HashMap::from([
        ("Pipeline".to_string(), name.to_string()),
        ("PipelineRun".to_string(), id.to_string()),
    ]);
    let paused_audit = pippy_orchestrator::audit::latest(AUDIT_PAUSED, &resource).await?;

    pause::resume_pipeline_run(name, id, reason, &actor).await?;
    println!(
        "{} Successfully resumed pipeline paused at {} by {}({}) - \"{}\"",
        "✓".green(),
        paused_audit.time,
        paused_audit.actor,
        paused_audit.email,
        paused_audit.message
    );
    Ok(())
}

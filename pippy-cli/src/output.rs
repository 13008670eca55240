//! Plain-text rendering for pipelines, runs and audit records

use chrono::{DateTime, Utc};
use colored::Colorize;

use pippy_core::{AuditRecord, Pipeline, PipelineRun, RunState, StageRun, StageState};
use pippy_orchestrator::audit::split_key;

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn run_duration(started: Option<DateTime<Utc>>, completed: Option<DateTime<Utc>>) -> String {
    let (Some(started), Some(completed)) = (started, completed) else {
        return String::new();
    };
    let seconds = (completed - started).num_seconds();
    if seconds < 60 {
        return format!("{seconds}s");
    }
    format!("{}m{}s", seconds / 60, seconds % 60)
}

fn approved_by(stage: &StageRun) -> String {
    let approval = &stage.metadata.approval;
    if approval.name.is_empty() && approval.login.is_empty() {
        return String::new();
    }
    format!("{}({})", approval.name, approval.login)
}

fn display_inputs(inputs: &std::collections::HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = inputs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    pairs.sort();
    pairs.join(",")
}

pub fn print_pipeline_summary(pipeline: &Pipeline) {
    println!("  {} {}", "▸".cyan(), pipeline.name.bold());
    println!("    Stages: {}", pipeline.stages.len().to_string().dimmed());
    if pipeline.locked {
        println!("    {}", "Locked".red());
    }
    println!();
}

pub fn print_pipeline(pipeline: &Pipeline) {
    println!("{}", "Pipeline Details:".bold());
    println!("  Name:   {}", pipeline.name.bold());
    println!("  Locked: {}", pipeline.locked);
    for (i, stage) in pipeline.stages.iter().enumerate() {
        println!("  Stage {}:", i + 1);
        println!("    Repo:     {}", stage.repo);
        println!(
            "    Workflow: {} {}",
            stage.workflow.name,
            format!("(id {})", stage.workflow.id).dimmed()
        );
        println!("    Approval: {}", stage.approval);
        if stage.monitor.workflow.ignore {
            println!("    Ignore failures: true");
        }
        if stage.monitor.workflow.rollback {
            println!("    Rollback on failure: true");
        }
        if let Some(datadog) = &stage.monitor.datadog {
            let rollback = if datadog.rollback { "(rollback)" } else { "" };
            println!(
                "    Datadog:  {} {}",
                datadog.monitors.join(","),
                rollback.dimmed()
            );
        }
        if !stage.input.is_empty() {
            println!("    Input:    {}", display_inputs(&stage.input).dimmed());
        }
    }
}

pub fn print_runs(runs: &[PipelineRun]) {
    println!(
        "{}",
        format!(
            "{:<20} {:<36} {:<16} {:<10} INPUTS",
            "TIME", "ID", "STATE", "RUN TIME"
        )
        .bold()
    );
    for run in runs {
        let elapsed = run_duration(Some(run.created), Some(run.updated));
        println!(
            "{:<20} {:<36} {:<16} {:<10} {}",
            format_time(run.created),
            run.id,
            run.state.to_string(),
            elapsed,
            display_inputs(&run.inputs).dimmed()
        );
    }
}

fn print_stage_run(stage: &StageRun) {
    let duration = run_duration(stage.started, stage.completed);
    let approver = approved_by(stage);

    match stage.state {
        StageState::Success => {
            println!("{} {} {}", "✓".green(), stage.title.bold(), duration.dimmed());
            println!("    {}", stage.url.dimmed());
        }
        StageState::InProgress => {
            println!("{} {} {}", "▸".cyan(), stage.title, duration.dimmed());
            println!("    {}", stage.url.dimmed());
        }
        StageState::Failed | StageState::ConcurrentError => {
            println!("{} {} {}", "✗".red(), stage.title.red(), duration.dimmed());
            println!("    {}", stage.url.dimmed());
            if !stage.reason.is_empty() {
                println!("    {}", stage.reason.red());
            }
        }
        StageState::PendingApproval => {
            println!("{} {}", "⏳".yellow(), stage.name.yellow());
        }
        _ => {
            println!("{} {}", "▸".dimmed(), stage.name.dimmed());
        }
    }

    if !approver.is_empty() {
        println!("    Approved by {}", approver.green());
    }
    if let Some(rollback) = &stage.rollback {
        println!(
            "    Rollback {} {}",
            rollback.state.to_string().yellow(),
            rollback.title.dimmed()
        );
        if !rollback.url.is_empty() {
            println!("        {}", rollback.url.dimmed());
        }
    }
}

pub fn print_run(name: &str, run: &PipelineRun) {
    println!(
        "Pipeline {} with run id {} started at {}",
        name.bold(),
        run.id.dimmed(),
        format_time(run.created)
    );
    println!();

    for stage in &run.stages {
        print_stage_run(stage);
    }

    let finished = format_time(run.updated);
    match run.state {
        RunState::Success => println!(
            "\n{} Successfully completed running at {}",
            "✓".green(),
            finished
        ),
        RunState::Failed => println!("\n{} Failed running pipeline at {}", "✗".red(), finished),
        RunState::Rollback => println!(
            "\n{} Rollback complete for pipeline at {}",
            "↩".yellow(),
            finished
        ),
        RunState::PendingApproval => println!(
            "\n{} Pending approval for pipeline at {}",
            "⏳".yellow(),
            finished
        ),
        RunState::Paused => println!("\n{} Pipeline paused at {}", "⏳".yellow(), finished),
        RunState::Canceled => println!("\n{} Pipeline canceled at {}", "✗".yellow(), finished),
        _ => {}
    }
}

pub fn print_audits(audits: &[(String, AuditRecord)]) {
    println!(
        "{}",
        format!(
            "{:<20} {:<14} {:<30} {:<12} MESSAGE",
            "TIME", "TYPE", "RESOURCE", "ACTOR"
        )
        .bold()
    );
    for (key, record) in audits {
        let (kind, _) = split_key(key);
        println!(
            "{:<20} {:<14} {:<30} {:<12} {}",
            format_time(record.time),
            kind,
            display_inputs(&record.resource),
            record.actor,
            record.message.dimmed()
        );
    }
}

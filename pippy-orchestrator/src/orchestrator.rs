//! Per-run orchestrator
//!
//! One orchestrator owns one pipeline run id. It ticks on a fixed period:
//! checkpoint the run, honor a pause, then advance stages left to right
//! until one is still in progress or the run reaches a terminal state.
//! Construction resumes any persisted state for the run id, so a restarted
//! process carries on where the previous one stopped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use pippy_core::{Pipeline, PipelineRun, RunState, StageRun, TriggerMetadata};
use pippy_github::{Client, GithubClient};
use pippy_rollout::{Config, Engine, EntityTargetVersion, RolloutOptions};

use crate::stage::StageOutcome;
use crate::status::{RunRecord, StatusMap};
use crate::{runs, stage_name, OrchestratorError, Result, APP_NAME};

/// Inputs replayed while the rollback sub-protocol is active.
#[derive(Debug, Clone, Default)]
pub(crate) struct RollbackInfo {
    pub(crate) inputs: HashMap<String, String>,
}

pub struct Orchestrator {
    pub(crate) engine: Option<Engine>,
    pub(crate) options: RolloutOptions,
    pub(crate) pipeline: Pipeline,
    pub(crate) started: DateTime<Utc>,
    pub(crate) stage_status: Arc<StatusMap>,
    pub(crate) pipeline_run_id: String,
    pub(crate) inputs: HashMap<String, String>,
    pub(crate) paused: bool,
    pub(crate) config: Config,
    pub(crate) github_client: Arc<dyn Client>,
    pub(crate) rollback: Option<RollbackInfo>,
    pub(crate) target_version: String,
    pub(crate) force: bool,
    pub(crate) trigger: TriggerMetadata,
    pub(crate) done: Arc<Notify>,
}

/// Build an orchestrator for `name`, resuming the run when `run_id` names
/// an existing one. Stage static-input values naming a template key are
/// resolved through `template_values` unless `inputs` already defines them.
pub async fn create_orchestrator(
    name: &str,
    run_id: &str,
    mut inputs: HashMap<String, String>,
    template_values: Option<&HashMap<String, String>>,
    trigger: TriggerMetadata,
    force: bool,
) -> Result<Orchestrator> {
    let pipeline = crate::pipelines::get_pipeline(name).await?;

    let run_id = if run_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        run_id.to_string()
    };

    if let Some(template_values) = template_values {
        for stage in &pipeline.stages {
            for (key, value) in &stage.input {
                if let Some(template_value) = template_values.get(value) {
                    if inputs.contains_key(key) {
                        info!(template_value = %value, "skip replacing template value since input is defined");
                        continue;
                    }
                    inputs.insert(key.clone(), template_value.clone());
                }
            }
        }
    }

    let mut orchestrator = Orchestrator {
        engine: None,
        options: RolloutOptions::default(),
        pipeline,
        started: Utc::now(),
        stage_status: Arc::new(StatusMap::new()),
        pipeline_run_id: run_id.clone(),
        inputs,
        paused: false,
        config: Config::default(),
        github_client: Arc::new(GithubClient::new()),
        rollback: None,
        target_version: run_id,
        force,
        trigger,
        done: Arc::new(Notify::new()),
    };

    orchestrator.set_config()?;
    orchestrator.load_pipeline_run().await?;

    Ok(orchestrator)
}

/// Drive a pipeline run to completion in the foreground.
pub async fn run_pipeline(
    name: &str,
    run_id: &str,
    inputs: HashMap<String, String>,
    template_values: Option<&HashMap<String, String>>,
    trigger: TriggerMetadata,
    force: bool,
) -> Result<Arc<StatusMap>> {
    let mut orchestrator =
        create_orchestrator(name, run_id, inputs, template_values, trigger, force).await?;

    let current = orchestrator.stage_status.get_state();
    if current == RunState::Success || current == RunState::Failed {
        warn!(state = %current, "rollout already completed");
        return Ok(orchestrator.status());
    }

    orchestrator.orchestrate(5000).await?;
    info!("orchestrator is done");
    Ok(orchestrator.status())
}

impl Orchestrator {
    pub fn run_id(&self) -> &str {
        &self.pipeline_run_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn status(&self) -> Arc<StatusMap> {
        Arc::clone(&self.stage_status)
    }

    /// Handle that stops the tick loop after its current iteration.
    pub fn stopper(&self) -> Arc<Notify> {
        Arc::clone(&self.done)
    }

    fn set_config(&mut self) -> Result<()> {
        let mut config = Config {
            application_name: APP_NAME.to_string(),
            ..Config::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.store_database_url = url;
                config.store_database_table = "orchestrator".to_string();
                self.config = config;
                return Ok(());
            }
        }

        let home = pippy_store::home_dir()?;
        config.store_directory = Some(home.join(".pippy").join("db").join("orchestrator"));
        self.config = config;
        Ok(())
    }

    pub(crate) fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(OrchestratorError::EngineNotReady)
    }

    pub(crate) async fn setup_engine(&mut self) -> Result<()> {
        info!("setting up new orchestrator engine");

        let engine = Engine::new(&self.config).await?;

        self.options = RolloutOptions {
            batch_percent: 1,
            success_percent: 100,
            success_timeout_secs: 0,
            duration_timeout_secs: 3600,
        };

        engine
            .set_rollout_options(APP_NAME, &self.pipeline.name, Some(self.options))
            .await?;
        engine
            .set_target_version(
                APP_NAME,
                &self.pipeline.name,
                EntityTargetVersion {
                    version: self.pipeline_run_id.clone(),
                },
            )
            .await?;

        self.engine = Some(engine);
        info!("new orchestrator engine setup done");
        Ok(())
    }

    /// Run the tick loop until the run terminates, checkpointing once more
    /// on the way out.
    pub async fn orchestrate(&mut self, interval_ms: u64) -> Result<()> {
        self.setup_engine().await?;

        let outcome = self.tick(interval_ms).await;
        self.engine = None;
        outcome?;

        self.save_pipeline_run().await
    }

    pub(crate) async fn tick(&mut self, interval_ms: u64) -> Result<()> {
        let done = Arc::clone(&self.done);
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = done.notified() => {
                    info!("orchestrator tick complete");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    info!("orchestrator tick");
                    self.save_pipeline_run().await?;

                    if self.paused {
                        self.stage_status.update_state(RunState::Paused);
                        info!("pipeline run paused");
                        return Ok(());
                    }

                    if self.target_version.is_empty() {
                        self.target_version = self.pipeline_run_id.clone();
                    }

                    let stages = self.pipeline.stages.clone();
                    for (i, stage) in stages.iter().enumerate() {
                        match self.stage_tick(i, stage).await? {
                            StageOutcome::Terminal => return Ok(()),
                            StageOutcome::InProgress => break,
                            StageOutcome::Advance => {}
                        }
                    }

                    if let Some(last_stage) = self.pipeline.stages.last() {
                        let last_name = stage_name(
                            self.pipeline.stages.len() - 1,
                            &last_stage.workflow.name,
                        );
                        if self.stage_status.get(&last_name).state
                            == pippy_core::StageState::Success
                        {
                            info!("rollout completed successfully");
                            self.stage_status.update_state(RunState::Success);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Checkpoint the in-memory stage state into the persisted run, and
    /// adopt operator-visible fields (`paused`, `created`) back from it.
    pub(crate) async fn save_pipeline_run(&mut self) -> Result<()> {
        let mut run = match runs::get_pipeline_run(&self.pipeline.name, &self.pipeline_run_id).await
        {
            Ok(run) => run,
            Err(err) if err.is_not_found() => {
                warn!("pipeline run not found creating new");
                PipelineRun {
                    id: self.pipeline_run_id.clone(),
                    pipeline_name: self.pipeline.name.clone(),
                    paused: false,
                    created: Utc::now(),
                    trigger: self.trigger.clone(),
                    ..Default::default()
                }
            }
            Err(err) => {
                error!(error = %err, "failed to get pipeline run");
                return Err(err);
            }
        };

        run.state = self.stage_status.get_state();
        run.updated = Utc::now();
        run.inputs = self.inputs.clone();
        run.version = self.target_version.clone();
        self.paused = run.paused;
        self.started = run.created;

        let mut stages = Vec::new();
        for (i, stage) in self.pipeline.stages.iter().enumerate() {
            let name = stage_name(i, &stage.workflow.name);
            let mut stage_run = StageRun {
                name: stage.workflow.name.clone(),
                ..Default::default()
            };
            if let Some(saved) = run.stages.get(i) {
                if saved.name == stage.workflow.name {
                    stage_run = saved.clone();
                }
            }
            set_stage_run(&mut stage_run, &self.stage_status.get(&name));
            stages.push(stage_run);
        }
        run.stages = stages;

        runs::save_pipeline_run(&run).await
    }

    /// Restore persisted state for this run id, if any.
    pub(crate) async fn load_pipeline_run(&mut self) -> Result<()> {
        let run = match runs::get_pipeline_run(&self.pipeline.name, &self.pipeline_run_id).await {
            Ok(run) => run,
            Err(err) if err.is_not_found() => {
                info!("pipeline run not found, new run");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "failed to get pipeline run");
                return Err(err);
            }
        };

        self.stage_status.update_state(run.state);
        self.inputs = run.inputs.clone();
        self.started = run.created;
        if run.state == RunState::Rollback {
            self.rollback = Some(RollbackInfo::default());
            self.target_version = run.version.clone();
        }

        for (i, stage_run) in run.stages.iter().enumerate() {
            self.stage_status
                .set(&stage_name(i, &stage_run.name), load_stage_run(stage_run));
        }

        Ok(())
    }
}

/// Copy the in-memory record into the persisted stage run, recursively for
/// the rollback chain.
pub(crate) fn set_stage_run(stage_run: &mut StageRun, record: &RunRecord) {
    stage_run.state = record.state;
    stage_run.url = record.run_url.clone();
    stage_run.run_id = record.run_id.clone();
    stage_run.title = record.title.clone();
    stage_run.started = record.started;
    stage_run.completed = record.completed;
    stage_run.reason = record.reason.clone();
    stage_run.concurrent_run_id = record.concurrent_run_id.clone();
    stage_run.input = record.inputs.clone();
    if let Some(rollback) = &record.rollback {
        let name = stage_run.name.clone();
        let nested = stage_run.rollback.get_or_insert_with(|| {
            Box::new(StageRun {
                name,
                ..Default::default()
            })
        });
        set_stage_run(nested, rollback);
    }
}

/// Rebuild the in-memory record from a persisted stage run; the displayed
/// approver collapses to `name(login)`.
pub(crate) fn load_stage_run(stage_run: &StageRun) -> RunRecord {
    let approval = &stage_run.metadata.approval;
    let approved_by = if !approval.name.is_empty() || !approval.login.is_empty() {
        format!("{}({})", approval.name, approval.login)
    } else {
        String::new()
    };

    RunRecord {
        state: stage_run.state,
        run_url: stage_run.url.clone(),
        run_id: stage_run.run_id.clone(),
        title: stage_run.title.clone(),
        started: stage_run.started,
        completed: stage_run.completed,
        reason: stage_run.reason.clone(),
        concurrent_run_id: stage_run.concurrent_run_id.clone(),
        approved_by,
        rollback: stage_run
            .rollback
            .as_ref()
            .map(|nested| Box::new(load_stage_run(nested))),
        ..Default::default()
    }
}

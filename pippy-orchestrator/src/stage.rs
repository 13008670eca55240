//! One step of the per-stage state machine
//!
//! A stage tick observes CI, feeds the rollout controller one client state
//! for this stage's target, and acts on the controller's verdict: declare
//! success, fail (optionally rolling back), flag a concurrent run, or
//! dispatch a new workflow run.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use pippy_core::{RunState, Stage, StageState};
use pippy_rollout::{ClientState, EntityTargetVersion, RolloutOptions};

use crate::monitor::DatadogMonitor;
use crate::orchestrator::{Orchestrator, RollbackInfo};
use crate::status::RunRecord;
use crate::{runs, stage_name, target_name, Result, APP_NAME};

/// Outcome of one stage tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    /// Stage is settled for this run; move on to the next one.
    Advance,
    /// Stage still has work in flight; stop iterating this tick.
    InProgress,
    /// The whole run reached a terminal state; stop the loop.
    Terminal,
}

const SUCCESS_STATES: [&str; 3] = ["completed", "success", "skipped"];
const IN_PROGRESS_STATES: [&str; 5] = ["in_progress", "queued", "requested", "waiting", "pending"];

/// The record a tick reads and writes: the stage's own record, or its
/// rollback shadow while the rollback sub-protocol is active.
fn effective_record(outer: &RunRecord, in_rollback: bool) -> RunRecord {
    if in_rollback {
        return outer.rollback.as_deref().cloned().unwrap_or_default();
    }
    outer.clone()
}

fn store_effective(outer: &mut RunRecord, record: RunRecord, in_rollback: bool) {
    if in_rollback {
        outer.rollback = Some(Box::new(record));
    } else {
        *outer = record;
    }
}

fn should_rollback(stage: &Stage, record: &RunRecord) -> bool {
    if stage.monitor.workflow.rollback && record.state == StageState::WorkflowFailed {
        return true;
    }
    stage
        .monitor
        .datadog
        .as_ref()
        .map_or(false, |datadog| datadog.rollback)
}

impl Orchestrator {
    pub(crate) async fn stage_tick(&mut self, i: usize, stage: &Stage) -> Result<StageOutcome> {
        let stage_name = stage_name(i, &stage.workflow.name);
        let current = self.stage_status.get(&stage_name);

        if current.state == StageState::Success || current.state == StageState::Failed {
            info!(stage = %stage_name, state = %current.state, "rollout already completed for stage");
            return Ok(StageOutcome::Advance);
        }

        if stage.approval && current.approved_by.is_empty() {
            info!(stage = %stage_name, "stage pending approval");
            let mut updated = current;
            updated.state = StageState::PendingApproval;
            self.stage_status.set(&stage_name, updated);
            self.stage_status.update_state(RunState::PendingApproval);
            return Ok(StageOutcome::Terminal);
        }

        self.get_current_state(i, stage).await?;

        let target = self.get_stage_target(i, stage).await?;

        let in_rollback = self.rollback.is_some();
        let outer = self.stage_status.get(&stage_name);
        let record = effective_record(&outer, in_rollback);
        let target_name = target_name(i, stage);
        info!(stage = %stage_name, target = %target_name, state = %record.state, "orchestrating target");

        let targets = match self
            .engine()?
            .orchestrate(APP_NAME, &target_name, &[target])
            .await
        {
            Ok(targets) => targets,
            Err(err) => {
                error!(error = %err, "failed to orchestrate");
                return Err(err.into());
            }
        };

        if in_rollback {
            // fast rollback mode: the CI outcome is the verdict, no
            // monitoring window
            if record.state == StageState::WorkflowSuccess {
                let mut outer = self.stage_status.get(&stage_name);
                if let Some(shadow) = outer.rollback.as_deref_mut() {
                    shadow.state = StageState::Success;
                }
                self.stage_status.set(&stage_name, outer);
                return Ok(StageOutcome::Advance);
            }
            if record.state == StageState::WorkflowFailed {
                let mut outer = self.stage_status.get(&stage_name);
                if let Some(shadow) = outer.rollback.as_deref_mut() {
                    shadow.state = StageState::Failed;
                }
                self.stage_status.set(&stage_name, outer);
                return Ok(StageOutcome::Advance);
            }
            return self.rollout_expected_state(i, stage, &targets).await;
        }

        let rollout_state = match self.engine()?.get_rollout_info(APP_NAME, &target_name).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "failed to get rollout info");
                return Err(err.into());
            }
        };

        info!(
            last_known_good_version = %rollout_state.last_known_good_version,
            last_known_bad_version = %rollout_state.last_known_bad_version,
            target_version = %rollout_state.target_version,
            rolling_version = %rollout_state.rolling_version,
            "current rollout state"
        );

        if rollout_state
            .last_known_good_version
            .eq_ignore_ascii_case(&self.target_version)
        {
            let mut outer = self.stage_status.get(&stage_name);
            outer.completed = Some(Utc::now());
            outer.state = StageState::Success;
            self.stage_status.set(&stage_name, outer);
            info!(stage = %stage_name, "rollout completed successfully");
            return Ok(StageOutcome::Advance);
        }

        if rollout_state
            .last_known_bad_version
            .eq_ignore_ascii_case(&self.target_version)
        {
            let mut outer = self.stage_status.get(&stage_name);
            if should_rollback(stage, &outer) && !rollout_state.last_known_good_version.is_empty()
            {
                info!(stage = %stage_name, "rolling back due to workflow or monitoring failure");
                self.stage_rollback(i, stage, &rollout_state.last_known_good_version)
                    .await;
                outer = self.stage_status.get(&stage_name);
            }
            outer.completed = Some(Utc::now());
            outer.state = StageState::Failed;
            let rolled_back = outer.rollback.is_some();
            self.stage_status.set(&stage_name, outer);
            if rolled_back {
                self.stage_status.update_state(RunState::Rollback);
            } else {
                self.stage_status.update_state(RunState::Failed);
            }
            info!(stage = %stage_name, "rollout failed");
            return Ok(StageOutcome::Terminal);
        }

        if !rollout_state
            .rolling_version
            .eq_ignore_ascii_case(&self.target_version)
        {
            let mut outer = self.stage_status.get(&stage_name);
            outer.state = StageState::ConcurrentError;
            outer.concurrent_run_id = rollout_state.rolling_version.clone();
            outer.reason = "concurrent rollout ongoing, wait or force version".to_string();
            self.stage_status.set(&stage_name, outer);
            self.stage_status.update_state(RunState::Failed);
            info!(
                target_version = %self.target_version,
                rolling_version = %rollout_state.rolling_version,
                "concurrent rollout ongoing, wait or force version"
            );
            return Ok(StageOutcome::Terminal);
        }

        self.rollout_expected_state(i, stage, &targets).await
    }

    /// Observe CI for this stage's run id and classify the outcome into the
    /// `Workflow_*` sub-states.
    pub(crate) async fn get_current_state(&mut self, i: usize, stage: &Stage) -> Result<()> {
        let stage_name = stage_name(i, &stage.workflow.name);
        let in_rollback = self.rollback.is_some();

        let mut outer = self.stage_status.get(&stage_name);
        let mut record = effective_record(&outer, in_rollback);

        // a stored CI verdict for this version is still good, we might be
        // in the monitoring phase
        if record.version == self.target_version
            && (record.state == StageState::WorkflowSuccess
                || record.state == StageState::WorkflowFailed)
        {
            info!(stage = %stage_name, version = %record.version, "using previously stored current run");
            return Ok(());
        }

        if record.run_id.is_empty() {
            record.run_id = Uuid::new_v4().to_string();
            record.state = StageState::WorkflowUnknown;
            info!(stage = %stage_name, run_id = %record.run_id, "creating new stage run id");
            store_effective(&mut outer, record.clone(), in_rollback);
            self.stage_status.set(&stage_name, outer.clone());
        }
        let stage_run_id = record.run_id.clone();

        let (org, repo) = stage.org_repo();
        let created = format!(">={}", self.started.to_rfc3339());
        info!(org, repo, workflow_id = stage.workflow.id, "listing github workflow runs");
        let workflow_runs = match self
            .github_client
            .list_workflow_runs(org, repo, stage.workflow.id, &created)
            .await
        {
            Ok(runs) => runs,
            Err(err) => {
                error!(org, repo, workflow_id = stage.workflow.id, error = %err, "error listing github workflow runs");
                return Err(err.into());
            }
        };

        record.run_id = stage_run_id.clone();
        record.version = String::new();
        for workflow_run in workflow_runs {
            if !workflow_run.name.contains(&stage_run_id) {
                continue;
            }
            record.run_url = workflow_run.url.clone();
            record.title = workflow_run.name.clone();
            record.version = self.target_version.clone();

            if SUCCESS_STATES.contains(&workflow_run.status.as_str())
                && (workflow_run.conclusion == "success"
                    || workflow_run.conclusion.is_empty()
                    || stage.monitor.workflow.ignore)
            {
                record.completed = workflow_run.updated_at;
                record.state = StageState::WorkflowSuccess;
                info!(run = %workflow_run.name, url = %workflow_run.url, "github workflow run completed successfully");
                break;
            }
            if IN_PROGRESS_STATES.contains(&workflow_run.status.as_str()) {
                record.state = StageState::InProgress;
                info!(run = %workflow_run.name, url = %workflow_run.url, "github workflow run still in progress");
                break;
            }
            record.completed = workflow_run.updated_at;
            record.reason = "github workflow run failed".to_string();
            record.state = StageState::WorkflowFailed;
            info!(run = %workflow_run.name, url = %workflow_run.url, "github workflow run failed");
            break;
        }

        store_effective(&mut outer, record, in_rollback);
        self.stage_status.set(&stage_name, outer);
        Ok(())
    }

    /// Build the client state handed to the rollout controller, installing
    /// options, target version and monitoring hook as the stage progresses.
    pub(crate) async fn get_stage_target(&mut self, i: usize, stage: &Stage) -> Result<ClientState> {
        let stage_name = stage_name(i, &stage.workflow.name);
        let target_name = target_name(i, stage);
        let outer = self.stage_status.get(&stage_name);

        if self.rollback.is_some() {
            let record = outer.rollback.as_deref().cloned().unwrap_or_default();
            let is_error = record.state == StageState::WorkflowFailed
                || record.state == StageState::InProgress;
            return Ok(ClientState {
                name: target_name,
                version: record.version.clone(),
                message: format!("target state {}", record.state),
                is_error,
                ..Default::default()
            });
        }

        let record = outer;
        let mut is_error = false;
        match record.state {
            StageState::WorkflowFailed => {
                is_error = true;
                // flush the batch so the controller can settle the verdict
                self.options = RolloutOptions {
                    batch_percent: 1,
                    success_percent: 100,
                    success_timeout_secs: 0,
                    duration_timeout_secs: 0,
                };
                info!(stage = %stage_name, "resetting rollout options");
                self.engine()?
                    .set_rollout_options(APP_NAME, &target_name, Some(self.options))
                    .await?;
            }
            StageState::WorkflowUnknown => {
                self.options = RolloutOptions {
                    batch_percent: 1,
                    success_percent: 100,
                    success_timeout_secs: 0,
                    duration_timeout_secs: 3600,
                };
                if stage.monitor.datadog.is_some() {
                    // monitoring window for externally monitored stages
                    self.options.success_timeout_secs = 900;
                }
                info!(stage = %stage_name, "setting rollout options");
                self.engine()?
                    .set_rollout_options(APP_NAME, &target_name, Some(self.options))
                    .await?;

                info!(target_version = %self.pipeline_run_id, "setting target version");
                let version = EntityTargetVersion {
                    version: self.pipeline_run_id.clone(),
                };
                if self.force {
                    self.engine()?
                        .force_target_version(APP_NAME, &target_name, version)
                        .await?;
                    let rollout_state =
                        self.engine()?.get_rollout_info(APP_NAME, &target_name).await?;
                    if !rollout_state.last_known_bad_version.is_empty() {
                        runs::cancel_pipeline_run(
                            &self.pipeline.name,
                            &rollout_state.last_known_bad_version,
                        )
                        .await?;
                    }
                } else {
                    self.engine()?
                        .set_target_version(APP_NAME, &target_name, version)
                        .await?;
                }

                if let Some(datadog) = &stage.monitor.datadog {
                    self.engine()?.set_monitoring_controller(
                        APP_NAME,
                        &target_name,
                        std::sync::Arc::new(DatadogMonitor::new(datadog.clone())),
                    );
                }
            }
            StageState::InProgress => {
                is_error = true;
            }
            _ => {}
        }

        Ok(ClientState {
            name: target_name,
            version: record.version.clone(),
            message: format!("target state {}", record.state),
            is_error,
            ..Default::default()
        })
    }

    /// Dispatch the workflow when the controller has assigned this stage's
    /// target the expected version.
    pub(crate) async fn rollout_expected_state(
        &mut self,
        i: usize,
        stage: &Stage,
        targets: &[ClientState],
    ) -> Result<StageOutcome> {
        let stage_name = stage_name(i, &stage.workflow.name);
        let in_rollback = self.rollback.is_some();

        let initial = self.stage_status.get(&stage_name);
        if in_rollback {
            if initial
                .rollback
                .as_deref()
                .map_or(false, |shadow| shadow.state == StageState::InProgress)
            {
                return Ok(StageOutcome::InProgress);
            }
        } else if initial.state == StageState::InProgress {
            self.stage_status.update_state(RunState::InProgress);
            return Ok(StageOutcome::InProgress);
        }

        info!("rolling out expected state");

        let (org, repo) = stage.org_repo();
        let target_name = target_name(i, stage);
        for target in targets {
            if !target_name.eq_ignore_ascii_case(&target.name) {
                continue;
            }

            let mut outer = self.stage_status.get(&stage_name);
            let mut record = effective_record(&outer, in_rollback);

            if record.version.eq_ignore_ascii_case(&target.version) {
                // already running the required version
                break;
            }
            if !target.version.eq_ignore_ascii_case(&self.target_version) {
                break;
            }

            let dynamic_inputs = match &self.rollback {
                Some(rollback) => rollback.inputs.clone(),
                None => self.inputs.clone(),
            };

            let mut inputs = HashMap::new();
            inputs.insert("pippy_run_id".to_string(), record.run_id.clone());

            // static values are a little smarter: empty ones stay out so a
            // dynamic value can take their place
            for (key, value) in &stage.input {
                if value.is_empty() {
                    continue;
                }
                inputs.insert(key.clone(), value.clone());
            }

            for (key, value) in dynamic_inputs {
                if inputs.contains_key(&key) {
                    warn!(stage = %target_name, org, repo, key = %key, "setting dynamic value since its defined as static");
                }
                inputs.insert(key, value);
            }

            record.started = Some(Utc::now());
            info!(stage = %target_name, org, repo, workflow_id = stage.workflow.id, "create a new github workflow run");
            if let Err(err) = self
                .github_client
                .create_workflow_dispatch(org, repo, stage.workflow.id, "main", &inputs)
                .await
            {
                error!(stage = %target_name, org, repo, workflow_id = stage.workflow.id, error = %err, "failed to create a new github workflow run");
                record.reason = err.to_string();
                record.state = StageState::WorkflowFailed;
                store_effective(&mut outer, record, in_rollback);
                self.stage_status.set(&stage_name, outer);
                return Err(err.into());
            }

            record.state = StageState::InProgress;
            record.inputs = inputs;
            store_effective(&mut outer, record, in_rollback);
            self.stage_status.set(&stage_name, outer);
            if in_rollback {
                self.stage_status.update_state(RunState::InProgress);
            }
            return Ok(StageOutcome::InProgress);
        }

        if initial.state != StageState::Success {
            return Ok(StageOutcome::InProgress);
        }
        Ok(StageOutcome::Advance)
    }

    /// Rollback sub-protocol: replay the last good run's inputs under the
    /// stage's shadow record until it settles.
    pub(crate) async fn stage_rollback(&mut self, i: usize, stage: &Stage, version: &str) {
        self.rollback = Some(RollbackInfo::default());
        self.target_version = version.to_string();
        self.stage_status.update_state(RunState::Rollback);

        let stage_name = stage_name(i, &stage.workflow.name);
        let mut outer = self.stage_status.get(&stage_name);
        if outer.rollback.is_none() {
            outer.rollback = Some(Box::default());
            self.stage_status.set(&stage_name, outer);
        }

        match runs::get_pipeline_run(&self.pipeline.name, version).await {
            Ok(run) => {
                if let Some(rollback) = self.rollback.as_mut() {
                    rollback.inputs = run.inputs;
                }
            }
            Err(err) => {
                // just record the rollback failure; the outer stage still
                // settles below
                error!(version, error = %err, "failed to get previous successful pipeline run");
                let mut outer = self.stage_status.get(&stage_name);
                let shadow = outer.rollback.get_or_insert_with(Box::default);
                shadow.state = StageState::Failed;
                shadow.reason =
                    format!("failed to get previous successful pipeline run {version}");
                self.stage_status.set(&stage_name, outer);
                return;
            }
        }

        loop {
            match Box::pin(self.stage_tick(i, stage)).await {
                Ok(StageOutcome::InProgress) => continue,
                _ => break,
            }
        }
    }
}

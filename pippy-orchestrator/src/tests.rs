//! End-to-end orchestrator scenarios against a stubbed CI client

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use pippy_core::{
    MonitorInfo, Pipeline, RunState, Stage, StageState, TriggerMetadata, Workflow, WorkflowInfo,
};
use pippy_github::{Client, GithubError, Org, Repo, WorkflowRun};
use pippy_rollout::{Config, RolloutOptions};

use crate::orchestrator::Orchestrator;
use crate::status::StatusMap;
use crate::{runs, stage_name};

#[derive(Debug, Clone)]
struct Dispatch {
    id: i64,
    inputs: HashMap<String, String>,
}

/// CI stub: runs become visible once the workflow was dispatched (the
/// `after_dispatch` gate), and a stage's rollback run becomes visible once
/// its shadow run id was dispatched.
#[derive(Default)]
struct RunStubClient {
    workflow_runs: Mutex<Vec<WorkflowRun>>,
    dispatches: Mutex<Vec<Dispatch>>,
    dispatch_err: Option<String>,
    after_dispatch: bool,
    stage_status: Option<Arc<StatusMap>>,
}

impl RunStubClient {
    fn plain() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_runs(runs: Vec<WorkflowRun>) -> Arc<Self> {
        Arc::new(Self {
            workflow_runs: Mutex::new(runs),
            after_dispatch: true,
            ..Self::default()
        })
    }

    fn dispatch_count(&self) -> usize {
        self.dispatches.lock().unwrap().len()
    }

    fn set_runs(&self, runs: Vec<WorkflowRun>) {
        *self.workflow_runs.lock().unwrap() = runs;
    }
}

fn completed_run(name: String, conclusion: &str) -> WorkflowRun {
    WorkflowRun {
        name,
        status: "completed".to_string(),
        conclusion: conclusion.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl Client for RunStubClient {
    async fn list_repos(&self, _repo_type: &str) -> pippy_github::Result<Vec<Repo>> {
        Ok(Vec::new())
    }

    async fn get_workflow(
        &self,
        _org: &str,
        _repo: &str,
        _id: i64,
    ) -> pippy_github::Result<Workflow> {
        Ok(Workflow::default())
    }

    async fn list_workflows(&self, _org: &str, _repo: &str) -> pippy_github::Result<Vec<Workflow>> {
        Ok(Vec::new())
    }

    async fn list_workflow_runs(
        &self,
        _org: &str,
        _repo: &str,
        workflow_id: i64,
        _created: &str,
    ) -> pippy_github::Result<Vec<WorkflowRun>> {
        let dispatches = self.dispatches.lock().unwrap();
        let mut dispatched = false;
        for dispatch in dispatches.iter() {
            dispatched = dispatch.id == workflow_id;
        }
        if !self.after_dispatch || dispatched {
            if let Some(status) = &self.stage_status {
                let record = status.get(&stage_name(0, "Workflow1"));
                if let Some(shadow) = record.rollback.as_deref() {
                    let shadow_dispatched = !shadow.run_id.is_empty()
                        && dispatches.iter().any(|dispatch| {
                            dispatch.inputs.get("pippy_run_id") == Some(&shadow.run_id)
                        });
                    if shadow_dispatched {
                        return Ok(vec![completed_run(shadow.run_id.clone(), "success")]);
                    }
                }
            }
            return Ok(self.workflow_runs.lock().unwrap().clone());
        }
        Ok(Vec::new())
    }

    async fn create_workflow_dispatch(
        &self,
        _org: &str,
        _repo: &str,
        workflow_id: i64,
        _git_ref: &str,
        inputs: &HashMap<String, String>,
    ) -> pippy_github::Result<()> {
        self.dispatches.lock().unwrap().push(Dispatch {
            id: workflow_id,
            inputs: inputs.clone(),
        });
        if let Some(err) = &self.dispatch_err {
            return Err(GithubError::api(500, err.clone()));
        }
        Ok(())
    }

    async fn validate_workflow(
        &self,
        _org: &str,
        _repo: &str,
        _path: &str,
    ) -> pippy_github::Result<(Vec<String>, HashMap<String, String>)> {
        Ok((Vec::new(), HashMap::new()))
    }

    async fn validate_workflow_full(
        &self,
        _org: &str,
        _repo: &str,
        _path: &str,
    ) -> pippy_github::Result<(String, String)> {
        Ok((String::new(), String::new()))
    }

    async fn list_orgs_for_user(&self) -> pippy_github::Result<Vec<Org>> {
        Ok(Vec::new())
    }
}

fn workflow(name: &str, id: i64) -> Workflow {
    Workflow {
        name: name.to_string(),
        id,
        ..Default::default()
    }
}

fn plain_stage(name: &str, id: i64) -> Stage {
    Stage {
        repo: "org1/repo1".to_string(),
        workflow: workflow(name, id),
        approval: false,
        input: HashMap::from([("version".to_string(), String::new())]),
        ..Default::default()
    }
}

fn two_stage_pipeline() -> Pipeline {
    Pipeline {
        name: "Pipeline1".to_string(),
        stages: vec![plain_stage("Workflow1", 1234), plain_stage("Workflow2", 2345)],
        locked: false,
    }
}

fn setup_orchestrator(pipeline: Pipeline, client: Arc<dyn Client>) -> Orchestrator {
    let run_id = Uuid::new_v4().to_string();
    Orchestrator {
        engine: None,
        options: RolloutOptions::default(),
        pipeline,
        started: Utc::now(),
        stage_status: Arc::new(StatusMap::new()),
        pipeline_run_id: run_id.clone(),
        inputs: HashMap::from([("version".to_string(), "dummy2".to_string())]),
        paused: false,
        config: Config {
            application_name: "pippy_test".to_string(),
            ..Config::default()
        },
        github_client: client,
        rollback: None,
        target_version: run_id,
        force: false,
        trigger: TriggerMetadata::default(),
        done: Arc::new(Notify::new()),
    }
}

fn memory_store() {
    let store = pippy_store::EmbeddedStore::in_memory().unwrap();
    pippy_store::set_default_store(Some(Arc::new(store)));
}

fn clear_store() {
    pippy_store::set_default_store(None);
}

/// Seed stage run ids the way a first observation tick would, and return
/// one CI run per stage with the given conclusion.
async fn seed_stage_runs(orchestrator: &mut Orchestrator, conclusion: &str) -> Vec<WorkflowRun> {
    let stages = orchestrator.pipeline.stages.clone();
    let mut runs = Vec::new();
    for (i, stage) in stages.iter().enumerate() {
        orchestrator.get_current_state(i, stage).await.unwrap();
        let record = orchestrator
            .stage_status
            .get(&stage_name(i, &stage.workflow.name));
        assert!(!record.run_id.is_empty());
        runs.push(completed_run(record.run_id, conclusion));
    }
    runs
}

#[tokio::test]
#[serial_test::serial]
async fn test_save_load_pipeline_run() {
    memory_store();

    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), RunStubClient::plain());
    orchestrator.load_pipeline_run().await.unwrap();

    orchestrator.stage_status.update_state(RunState::InProgress);
    let name = stage_name(0, "Workflow1");
    let stage_run_id = Uuid::new_v4().to_string();
    orchestrator.stage_status.set(
        &name,
        crate::status::RunRecord {
            state: StageState::InProgress,
            run_url: "dummyurl".to_string(),
            run_id: stage_run_id.clone(),
            title: "test title this is cool!".to_string(),
            ..Default::default()
        },
    );

    orchestrator.save_pipeline_run().await.unwrap();
    orchestrator
        .stage_status
        .update_state(RunState::PendingApproval);
    orchestrator
        .stage_status
        .set(&name, crate::status::RunRecord::default());

    orchestrator.load_pipeline_run().await.unwrap();

    let record = orchestrator.stage_status.get(&name);
    assert_eq!(record.title, "test title this is cool!");
    assert_eq!(record.run_id, stage_run_id);
    assert_eq!(orchestrator.stage_status.get_state(), RunState::InProgress);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_good() {
    memory_store();

    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), RunStubClient::plain());
    let runs = seed_stage_runs(&mut orchestrator, "").await;

    let client = RunStubClient::with_runs(runs);
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    assert_eq!(orchestrator.stage_status.get_state(), RunState::Success);
    assert_eq!(client.dispatch_count(), 2);

    for i in 0..2 {
        let record = orchestrator
            .stage_status
            .get(&stage_name(i, &orchestrator.pipeline.stages[i].workflow.name));
        assert_eq!(record.state, StageState::Success);
    }

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_bad() {
    memory_store();

    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), RunStubClient::plain());
    let runs = seed_stage_runs(&mut orchestrator, "failure").await;

    let client = RunStubClient::with_runs(runs);
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    assert_eq!(orchestrator.stage_status.get_state(), RunState::Failed);

    // the failing first stage stops the run before the second dispatches
    let record = orchestrator.stage_status.get(&stage_name(1, "Workflow2"));
    assert_eq!(record.state, StageState::WorkflowUnknown);
    assert_eq!(client.dispatch_count(), 1);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_ignore_failures() {
    memory_store();

    let mut pipeline = two_stage_pipeline();
    for stage in &mut pipeline.stages {
        stage.monitor = MonitorInfo {
            workflow: WorkflowInfo {
                ignore: true,
                rollback: false,
            },
            datadog: None,
        };
    }

    let mut orchestrator = setup_orchestrator(pipeline, RunStubClient::plain());
    let runs = seed_stage_runs(&mut orchestrator, "failure").await;

    let client = RunStubClient::with_runs(runs);
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    assert_eq!(orchestrator.stage_status.get_state(), RunState::Success);
    for i in 0..2 {
        let record = orchestrator
            .stage_status
            .get(&stage_name(i, &orchestrator.pipeline.stages[i].workflow.name));
        assert_eq!(record.state, StageState::Success);
    }
    assert_eq!(client.dispatch_count(), 2);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_approval() {
    memory_store();

    let mut pipeline = two_stage_pipeline();
    pipeline.stages[1].approval = true;

    let mut orchestrator = setup_orchestrator(pipeline, RunStubClient::plain());
    let first_stage = orchestrator.pipeline.stages[0].clone();
    orchestrator
        .get_current_state(0, &first_stage)
        .await
        .unwrap();

    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    let client = RunStubClient::with_runs(vec![completed_run(record.run_id, "")]);
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    assert_eq!(
        orchestrator.stage_status.get_state(),
        RunState::PendingApproval
    );
    let record = orchestrator.stage_status.get(&stage_name(1, "Workflow2"));
    assert_eq!(record.state, StageState::PendingApproval);
    assert_eq!(client.dispatch_count(), 1);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_paused() {
    memory_store();

    let client = RunStubClient::plain();
    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), client.clone());

    orchestrator.save_pipeline_run().await.unwrap();

    let mut run = runs::get_pipeline_run("Pipeline1", orchestrator.run_id())
        .await
        .unwrap();
    run.paused = true;
    runs::save_pipeline_run(&run).await.unwrap();

    orchestrator.orchestrate(1).await.unwrap();

    assert_eq!(orchestrator.stage_status.get_state(), RunState::Paused);
    assert_eq!(client.dispatch_count(), 0);

    // resuming lets the next tick proceed
    let mut run = runs::get_pipeline_run("Pipeline1", orchestrator.run_id())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Paused);
    run.paused = false;
    runs::save_pipeline_run(&run).await.unwrap();

    let seeded = seed_stage_runs(&mut orchestrator, "").await;
    let client = RunStubClient::with_runs(seeded);
    orchestrator.github_client = client.clone();
    orchestrator.orchestrate(1).await.unwrap();
    assert_eq!(orchestrator.stage_status.get_state(), RunState::Success);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_approval_multi() {
    memory_store();

    let mut pipeline = two_stage_pipeline();
    pipeline.stages[1].approval = true;

    {
        let mut orchestrator = setup_orchestrator(pipeline.clone(), RunStubClient::plain());
        let first_stage = orchestrator.pipeline.stages[0].clone();
        orchestrator
            .get_current_state(0, &first_stage)
            .await
            .unwrap();
        let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
        let client = RunStubClient::with_runs(vec![completed_run(record.run_id, "")]);
        orchestrator.github_client = client.clone();

        orchestrator.orchestrate(1).await.unwrap();

        assert_eq!(
            orchestrator.stage_status.get_state(),
            RunState::PendingApproval
        );
        assert_eq!(client.dispatch_count(), 1);
    }

    let mut orchestrator = setup_orchestrator(pipeline, RunStubClient::plain());
    let first_stage = orchestrator.pipeline.stages[0].clone();
    orchestrator
        .get_current_state(0, &first_stage)
        .await
        .unwrap();
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    let client = RunStubClient::with_runs(vec![completed_run(record.run_id, "failure")]);
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::Failed);
    assert_eq!(orchestrator.stage_status.get_state(), RunState::Failed);
    assert_eq!(client.dispatch_count(), 1);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_rollback() {
    memory_store();
    let dir = tempfile::tempdir().unwrap();

    let pipeline = Pipeline {
        name: "Pipeline1".to_string(),
        stages: vec![Stage {
            monitor: MonitorInfo {
                workflow: WorkflowInfo {
                    rollback: true,
                    ignore: false,
                },
                datadog: None,
            },
            ..plain_stage("Workflow1", 1234)
        }],
        locked: false,
    };

    let mut orchestrator = setup_orchestrator(pipeline.clone(), RunStubClient::plain());
    orchestrator.config.store_directory = Some(dir.path().join("orchestrator"));

    let runs = seed_stage_runs(&mut orchestrator, "").await;
    let first_client = RunStubClient::with_runs(runs);
    orchestrator.github_client = first_client.clone();

    orchestrator.orchestrate(1).await.unwrap();
    assert_eq!(orchestrator.stage_status.get_state(), RunState::Success);

    // LKG is established, roll out a new run that fails its workflow
    let prev_run_id = orchestrator.pipeline_run_id.clone();
    let run_id = Uuid::new_v4().to_string();
    orchestrator.pipeline_run_id = run_id.clone();
    orchestrator.target_version = run_id.clone();
    orchestrator.stage_status = Arc::new(StatusMap::new());
    orchestrator.inputs = HashMap::from([("version".to_string(), "dummy4".to_string())]);

    orchestrator
        .get_current_state(0, &pipeline.stages[0])
        .await
        .unwrap();
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::WorkflowUnknown);

    let client = Arc::new(RunStubClient {
        workflow_runs: Mutex::new(vec![completed_run(record.run_id, "failure")]),
        after_dispatch: true,
        stage_status: Some(orchestrator.stage_status.clone()),
        ..RunStubClient::default()
    });
    orchestrator.github_client = client.clone();

    orchestrator.orchestrate(1).await.unwrap();

    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    let shadow = record.rollback.as_deref().expect("rollback record missing");

    assert_eq!(record.state, StageState::Failed);
    assert_eq!(record.version, run_id);
    assert_eq!(record.inputs.get("version"), Some(&"dummy4".to_string()));
    assert_eq!(shadow.state, StageState::Success);
    assert_eq!(shadow.version, prev_run_id);
    assert_eq!(shadow.inputs.get("version"), Some(&"dummy2".to_string()));
    assert_eq!(orchestrator.stage_status.get_state(), RunState::Rollback);
    assert_eq!(client.dispatch_count(), 2);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_bad_dispatch_err() {
    memory_store();

    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), RunStubClient::plain());
    seed_stage_runs(&mut orchestrator, "").await;

    let client = Arc::new(RunStubClient {
        dispatch_err: Some("simulating dispatch error".to_string()),
        after_dispatch: true,
        ..RunStubClient::default()
    });
    orchestrator.github_client = client.clone();

    orchestrator.setup_engine().await.unwrap();

    // the failed dispatch surfaces from the tick
    assert!(orchestrator.tick(1).await.is_err());
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    orchestrator.tick(1).await.unwrap();

    assert_eq!(orchestrator.stage_status.get_state(), RunState::Failed);

    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert!(
        record.reason.contains("simulating dispatch error"),
        "unexpected reason: {}",
        record.reason
    );

    let record = orchestrator.stage_status.get(&stage_name(1, "Workflow2"));
    assert_eq!(record.state, StageState::WorkflowUnknown);
    assert_eq!(client.dispatch_count(), 1);

    clear_store();
}

#[tokio::test]
#[serial_test::serial]
async fn test_orchestrate_concurrent_error() {
    memory_store();

    let mut orchestrator = setup_orchestrator(two_stage_pipeline(), RunStubClient::plain());
    let old_run_id = orchestrator.pipeline_run_id.clone();

    let mut in_progress = Vec::new();
    for run in seed_stage_runs(&mut orchestrator, "").await {
        in_progress.push(WorkflowRun {
            status: "in_progress".to_string(),
            conclusion: String::new(),
            ..run
        });
    }

    orchestrator.setup_engine().await.unwrap();

    let client = RunStubClient::with_runs(in_progress);
    orchestrator.github_client = client.clone();

    let stage = orchestrator.pipeline.stages[0].clone();
    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::InProgress
    );
    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::InProgress
    );

    assert_eq!(orchestrator.stage_status.get_state(), RunState::InProgress);
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::InProgress);
    assert_eq!(client.dispatch_count(), 1);

    // a second run targeting the same stage loses to the rolling version
    let concurrent_run_id = Uuid::new_v4().to_string();
    orchestrator.pipeline_run_id = concurrent_run_id.clone();
    orchestrator.target_version = concurrent_run_id;

    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::Terminal
    );
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::ConcurrentError);
    assert_eq!(record.concurrent_run_id, old_run_id);
    assert_eq!(orchestrator.stage_status.get_state(), RunState::Failed);

    // the original run completes once its workflow succeeds
    orchestrator.pipeline_run_id = old_run_id.clone();
    orchestrator.target_version = old_run_id;

    let successful: Vec<WorkflowRun> = client
        .workflow_runs
        .lock()
        .unwrap()
        .iter()
        .map(|run| WorkflowRun {
            status: "completed".to_string(),
            conclusion: "success".to_string(),
            ..run.clone()
        })
        .collect();
    client.set_runs(successful);

    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::InProgress
    );
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::Advance
    );
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::Success);

    // a third run may proceed once the rolling version catches up
    let new_run_id = Uuid::new_v4().to_string();
    orchestrator.pipeline_run_id = new_run_id.clone();
    orchestrator.target_version = new_run_id;
    let client = RunStubClient::plain();
    orchestrator.github_client = client.clone();

    let mut record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    record.state = StageState::WorkflowUnknown;
    orchestrator
        .stage_status
        .set(&stage_name(0, "Workflow1"), record);

    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::InProgress
    );
    assert_eq!(
        orchestrator.stage_tick(0, &stage).await.unwrap(),
        crate::stage::StageOutcome::InProgress
    );
    let record = orchestrator.stage_status.get(&stage_name(0, "Workflow1"));
    assert_eq!(record.state, StageState::InProgress);
    assert_eq!(client.dispatch_count(), 1);

    clear_store();
}

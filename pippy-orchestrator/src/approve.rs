//! Approval interlock
//!
//! Stages flagged `approval` park the run in `PendingApproval` until an
//! operator records an approval. A locked pipeline rejects new approvals,
//! citing the latest `Locked` audit record. Approvals can be withdrawn
//! while the stage has not started.

use std::collections::HashMap;

use pippy_core::audit::{AUDIT_APPROVED, AUDIT_CANCEL_APPROVAL, AUDIT_LOCKED};
use pippy_core::{Pipeline, PipelineRun, StageRunApproval, StageState};

use crate::{audit, pipelines, runs, Actor, OrchestratorError, Result};

fn run_resource(run: &PipelineRun) -> HashMap<String, String> {
    HashMap::from([
        ("Pipeline".to_string(), run.pipeline_name.clone()),
        ("PipelineRun".to_string(), run.id.clone()),
    ])
}

async fn reject_when_locked(pipeline: &Pipeline) -> Result<()> {
    if !pipeline.locked {
        return Ok(());
    }

    let resource = HashMap::from([("Pipeline".to_string(), pipeline.name.clone())]);
    let latest = audit::latest(AUDIT_LOCKED, &resource).await?;
    Err(OrchestratorError::Locked(format!(
        "pipeline {} locked at {} by {}({}) due to {}",
        pipeline.name, latest.time, latest.actor, latest.email, latest.message
    )))
}

/// Stages that require approval and have none yet: `(index, name, state)`.
pub fn pending_approvals(
    pipeline: &Pipeline,
    run: &PipelineRun,
) -> Vec<(usize, String, StageState)> {
    let mut pending = Vec::new();
    for (i, stage) in pipeline.stages.iter().enumerate() {
        if !stage.approval {
            continue;
        }
        let Some(stage_run) = run.stages.get(i) else {
            continue;
        };
        if stage_run.metadata.approval.name.is_empty() {
            pending.push((i, stage_run.name.clone(), stage_run.state));
        }
    }
    pending
}

/// Approved stages whose approval can still be withdrawn (the stage has
/// not moved past `PendingApproval`).
pub fn cancelable_approvals(
    pipeline: &Pipeline,
    run: &PipelineRun,
) -> Vec<(usize, String, StageState)> {
    let mut cancelable = Vec::new();
    for (i, stage) in pipeline.stages.iter().enumerate() {
        if !stage.approval {
            continue;
        }
        let Some(stage_run) = run.stages.get(i) else {
            continue;
        };
        if stage_run.metadata.approval.name.is_empty() {
            continue;
        }
        if stage_run.state == StageState::PendingApproval || stage_run.state == StageState::New {
            cancelable.push((i, stage_run.name.clone(), stage_run.state));
        }
    }
    cancelable
}

/// Record an approval for one stage of a run.
pub async fn approve_pipeline_run(
    name: &str,
    id: &str,
    stage_num: i64,
    actor: &Actor,
) -> Result<()> {
    let pipeline = pipelines::get_pipeline(name).await?;
    reject_when_locked(&pipeline).await?;

    let mut run = runs::get_pipeline_run(name, id).await?;

    if stage_num < 0 && stage_num >= run.stages.len() as i64 {
        return Err(OrchestratorError::InvalidStage {
            stage: stage_num,
            max: run.stages.len().saturating_sub(1),
        });
    }
    let stage_num = stage_num as usize;

    if !run.stages[stage_num].metadata.approval.name.is_empty() {
        return Ok(());
    }

    run.stages[stage_num].metadata.approval = StageRunApproval {
        name: actor.name.clone(),
        email: actor.email.clone(),
        ..Default::default()
    };

    let reason = format!("Stage Approved {} - {}", stage_num, run.stages[stage_num].name);
    audit::save(
        AUDIT_APPROVED,
        run_resource(&run),
        &actor.name,
        &actor.email,
        &reason,
    )
    .await?;

    runs::save_pipeline_run(&run).await
}

/// Withdraw a stage's approval. Audited with the `Approved` kind.
pub async fn cancel_approve_pipeline_run(
    name: &str,
    id: &str,
    stage_num: i64,
    actor: &Actor,
) -> Result<()> {
    let mut run = runs::get_pipeline_run(name, id).await?;

    if stage_num < 0 && stage_num >= run.stages.len() as i64 {
        return Err(OrchestratorError::InvalidStage {
            stage: stage_num,
            max: run.stages.len().saturating_sub(1),
        });
    }
    let stage_num = stage_num as usize;

    if run.stages[stage_num].metadata.approval.name.is_empty() {
        return Ok(());
    }

    let reason = format!(
        "Canceled Approval for stage {} - {}",
        stage_num, run.stages[stage_num].name
    );
    audit::save(
        AUDIT_APPROVED,
        run_resource(&run),
        &actor.name,
        &actor.email,
        &reason,
    )
    .await?;

    run.stages[stage_num].metadata.approval = StageRunApproval::default();

    runs::save_pipeline_run(&run).await
}

/// Withdraw every still-cancelable approval in one pass, the multi-select
/// flow. Each withdrawal is audited with the `CancelApproval` kind.
pub async fn cancel_approvals(
    name: &str,
    id: &str,
    stage_nums: &[usize],
    actor: &Actor,
) -> Result<()> {
    let mut run = runs::get_pipeline_run(name, id).await?;

    for &stage_num in stage_nums {
        let Some(stage_run) = run.stages.get_mut(stage_num) else {
            continue;
        };
        if stage_run.metadata.approval.name.is_empty() {
            continue;
        }

        stage_run.metadata.approval = StageRunApproval::default();

        let reason = format!("Canceled Approval for stage {} - {}", stage_num, stage_run.name);
        audit::save(
            AUDIT_CANCEL_APPROVAL,
            run_resource(&run),
            &actor.name,
            &actor.email,
            &reason,
        )
        .await?;
    }

    runs::save_pipeline_run(&run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pippy_core::{Stage, StageRun, Workflow};
    use std::sync::Arc;

    fn memory_store() {
        let store = pippy_store::EmbeddedStore::in_memory().unwrap();
        pippy_store::set_default_store(Some(Arc::new(store)));
    }

    fn actor() -> Actor {
        Actor {
            name: "octocat".to_string(),
            email: "octocat@example.com".to_string(),
        }
    }

    fn gated_stage(name: &str, id: i64) -> Stage {
        Stage {
            repo: "org1/repo1".to_string(),
            workflow: Workflow {
                name: name.to_string(),
                id,
                ..Default::default()
            },
            approval: true,
            ..Default::default()
        }
    }

    async fn seed_pipeline_and_run() -> (Pipeline, PipelineRun) {
        let pipeline = Pipeline {
            name: "Pipeline1".to_string(),
            stages: vec![gated_stage("Workflow1", 1234), gated_stage("Workflow2", 2345)],
            locked: false,
        };
        pipelines::save_pipeline(&pipeline).await.unwrap();

        let run = PipelineRun {
            id: "run-1".to_string(),
            pipeline_name: "Pipeline1".to_string(),
            created: Utc::now(),
            updated: Utc::now(),
            stages: vec![
                StageRun {
                    name: "Workflow1".to_string(),
                    state: StageState::PendingApproval,
                    ..Default::default()
                },
                StageRun {
                    name: "Workflow2".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        runs::save_pipeline_run(&run).await.unwrap();
        (pipeline, run)
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_approve_records_actor_and_audit() {
        memory_store();
        let (pipeline, run) = seed_pipeline_and_run().await;

        assert_eq!(pending_approvals(&pipeline, &run).len(), 2);

        approve_pipeline_run("Pipeline1", "run-1", 0, &actor()).await.unwrap();

        let saved = runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap();
        assert_eq!(saved.stages[0].metadata.approval.name, "octocat");
        assert!(saved.stages[1].metadata.approval.name.is_empty());
        assert_eq!(pending_approvals(&pipeline, &saved).len(), 1);

        // second approval for the same stage is a no-op
        approve_pipeline_run(
            "Pipeline1",
            "run-1",
            0,
            &Actor {
                name: "hubot".to_string(),
                email: "hubot@example.com".to_string(),
            },
        )
        .await
        .unwrap();
        let saved = runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap();
        assert_eq!(saved.stages[0].metadata.approval.name, "octocat");

        pippy_store::set_default_store(None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_locked_pipeline_rejects_approval() {
        memory_store();
        let (_, _) = seed_pipeline_and_run().await;

        crate::lock::lock_pipeline("Pipeline1", "release freeze", &actor())
            .await
            .unwrap();

        let err = approve_pipeline_run("Pipeline1", "run-1", 0, &actor())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("locked"), "unexpected error: {message}");
        assert!(message.contains("release freeze"));
        assert!(message.contains("octocat"));

        pippy_store::set_default_store(None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_cancel_approval_only_before_stage_starts() {
        memory_store();
        let (pipeline, _) = seed_pipeline_and_run().await;

        approve_pipeline_run("Pipeline1", "run-1", 0, &actor()).await.unwrap();
        approve_pipeline_run("Pipeline1", "run-1", 1, &actor()).await.unwrap();

        // stage 1 has started; its approval is no longer cancelable
        let mut run = runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap();
        run.stages[1].state = StageState::InProgress;
        runs::save_pipeline_run(&run).await.unwrap();

        let cancelable = cancelable_approvals(&pipeline, &run);
        assert_eq!(cancelable.len(), 1);
        assert_eq!(cancelable[0].0, 0);

        cancel_approve_pipeline_run("Pipeline1", "run-1", 0, &actor()).await.unwrap();
        let saved = runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap();
        assert!(saved.stages[0].metadata.approval.name.is_empty());

        pippy_store::set_default_store(None);
    }
}

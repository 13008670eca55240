//! Pause/resume interlock
//!
//! Pausing flips the persisted run's flag; the owning orchestrator sees it
//! at its next checkpoint, parks the run in `Paused` and exits. Resume
//! clears the flag so a fresh invocation can pick the run back up.

use std::collections::HashMap;

use pippy_core::audit::{AUDIT_PAUSED, AUDIT_RESUMED};

use crate::{audit, runs, Actor, Result};

fn run_resource(pipeline: &str, id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("Pipeline".to_string(), pipeline.to_string()),
        ("PipelineRun".to_string(), id.to_string()),
    ])
}

pub async fn pause_pipeline_run(name: &str, id: &str, reason: &str, actor: &Actor) -> Result<()> {
    let mut run = runs::get_pipeline_run(name, id).await?;
    if run.paused {
        return Ok(());
    }

    run.paused = true;
    audit::save(
        AUDIT_PAUSED,
        run_resource(&run.pipeline_name, &run.id),
        &actor.name,
        &actor.email,
        reason,
    )
    .await?;
    runs::save_pipeline_run(&run).await
}

pub async fn resume_pipeline_run(name: &str, id: &str, reason: &str, actor: &Actor) -> Result<()> {
    let mut run = runs::get_pipeline_run(name, id).await?;
    if !run.paused {
        return Ok(());
    }

    run.paused = false;
    audit::save(
        AUDIT_RESUMED,
        run_resource(&run.pipeline_name, &run.id),
        &actor.name,
        &actor.email,
        reason,
    )
    .await?;
    runs::save_pipeline_run(&run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pippy_core::PipelineRun;
    use std::sync::Arc;

    #[tokio::test]
    #[serial_test::serial]
    async fn test_pause_resume_round_trip() {
        let store = pippy_store::EmbeddedStore::in_memory().unwrap();
        pippy_store::set_default_store(Some(Arc::new(store)));

        let run = PipelineRun {
            id: "run-1".to_string(),
            pipeline_name: "Pipeline1".to_string(),
            created: Utc::now(),
            updated: Utc::now(),
            ..Default::default()
        };
        runs::save_pipeline_run(&run).await.unwrap();

        let actor = Actor {
            name: "octocat".to_string(),
            email: "octocat@example.com".to_string(),
        };

        pause_pipeline_run("Pipeline1", "run-1", "maintenance", &actor).await.unwrap();
        assert!(runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap().paused);

        // pausing an already paused run changes nothing
        pause_pipeline_run("Pipeline1", "run-1", "again", &actor).await.unwrap();
        let latest = audit::latest(AUDIT_PAUSED, &run_resource("Pipeline1", "run-1"))
            .await
            .unwrap();
        assert_eq!(latest.message, "maintenance");

        resume_pipeline_run("Pipeline1", "run-1", "done", &actor).await.unwrap();
        assert!(!runs::get_pipeline_run("Pipeline1", "run-1").await.unwrap().paused);

        pippy_store::set_default_store(None);
    }
}

//! Pipeline CRUD
//!
//! Pipelines are stored whole under `pipeline:<name>`; deleting one also
//! deletes every run recorded under its `pipelinerun:<name>/` prefix.

use pippy_core::{Pipeline, Stage, Workflow};
use pippy_github::Client;

use crate::{OrchestratorError, Result, PIPELINE_PREFIX, PIPELINE_RUN_PREFIX};

pub async fn list_pipelines() -> Result<Vec<Pipeline>> {
    let store = pippy_store::get().await?;
    let mut pipelines = Vec::new();
    for (_, value) in store.load_values(PIPELINE_PREFIX).await? {
        let pipeline: Pipeline =
            serde_json::from_value(value).map_err(pippy_store::StoreError::from)?;
        pipelines.push(pipeline);
    }
    Ok(pipelines)
}

pub async fn get_pipeline_count() -> Result<u64> {
    let store = pippy_store::get().await?;
    Ok(store.count(PIPELINE_PREFIX).await?)
}

pub async fn get_pipeline(name: &str) -> Result<Pipeline> {
    let store = pippy_store::get().await?;
    let pipeline =
        pippy_store::load_json(store.as_ref(), &format!("{PIPELINE_PREFIX}{name}")).await?;
    Ok(pipeline)
}

pub async fn save_pipeline(pipeline: &Pipeline) -> Result<()> {
    let store = pippy_store::get().await?;
    pippy_store::save_json(
        store.as_ref(),
        &format!("{PIPELINE_PREFIX}{}", pipeline.name),
        pipeline,
    )
    .await?;
    Ok(())
}

/// Delete a pipeline and cascade to all of its runs.
pub async fn delete_pipeline(name: &str) -> Result<()> {
    let store = pippy_store::get().await?;
    match store.delete(&format!("{PIPELINE_PREFIX}{name}")).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    store
        .delete_prefix(&format!("{PIPELINE_RUN_PREFIX}{name}/"))
        .await?;
    Ok(())
}

/// Check a stage's workflow is pippy-ready; a fetch failure skips the check.
pub async fn validate_stage_workflow(
    client: &dyn Client,
    org_repo: &str,
    workflow: &Workflow,
) -> Result<()> {
    let (org, repo) = org_repo.split_once('/').unwrap_or((org_repo, ""));
    let changes = match client.validate_workflow(org, repo, &workflow.path).await {
        Ok((changes, _)) => changes,
        Err(_) => return Ok(()),
    };
    if !changes.is_empty() {
        return Err(OrchestratorError::Invalid(
            "this workflow is not pippy ready, please validate using pippy workflow validate"
                .to_string(),
        ));
    }
    Ok(())
}

/// Create a pipeline from a prepared stage list, validating every workflow.
pub async fn create_pipeline(
    name: &str,
    stages: Vec<Stage>,
    client: &dyn Client,
) -> Result<Pipeline> {
    if get_pipeline(name).await.is_ok() {
        return Err(OrchestratorError::Invalid(format!(
            "Pipeline {name} already exists use pipeline show command"
        )));
    }

    for stage in &stages {
        validate_stage_workflow(client, &stage.repo, &stage.workflow).await?;
    }

    let pipeline = Pipeline {
        name: name.to_string(),
        stages,
        locked: false,
    };
    save_pipeline(&pipeline).await?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn memory_store() {
        let store = pippy_store::EmbeddedStore::in_memory().unwrap();
        pippy_store::set_default_store(Some(Arc::new(store)));
    }

    fn sample_pipeline() -> Pipeline {
        Pipeline {
            name: "Pipeline1".to_string(),
            stages: vec![Stage {
                repo: "org1/repo1".to_string(),
                workflow: Workflow {
                    name: "Workflow1".to_string(),
                    id: 1234,
                    ..Default::default()
                },
                approval: false,
                input: HashMap::from([("version".to_string(), "dummy2".to_string())]),
                ..Default::default()
            }],
            locked: false,
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_save_get_pipeline() {
        memory_store();

        let pipeline = sample_pipeline();
        save_pipeline(&pipeline).await.unwrap();

        let saved = get_pipeline(&pipeline.name).await.unwrap();
        assert_eq!(saved, pipeline);

        assert_eq!(get_pipeline_count().await.unwrap(), 1);
        assert_eq!(list_pipelines().await.unwrap().len(), 1);

        pippy_store::set_default_store(None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_delete_pipeline_cascades_to_runs() {
        memory_store();

        let pipeline = sample_pipeline();
        save_pipeline(&pipeline).await.unwrap();

        let store = pippy_store::get().await.unwrap();
        store
            .save_value(
                &format!("{PIPELINE_RUN_PREFIX}Pipeline1/run-1"),
                serde_json::json!({"id": "run-1"}),
            )
            .await
            .unwrap();

        delete_pipeline("Pipeline1").await.unwrap();
        assert!(get_pipeline("Pipeline1").await.unwrap_err().is_not_found());
        assert_eq!(store.count(PIPELINE_RUN_PREFIX).await.unwrap(), 0);

        // deleting again is fine
        delete_pipeline("Pipeline1").await.unwrap();

        pippy_store::set_default_store(None);
    }
}

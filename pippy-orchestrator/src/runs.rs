//! Pipeline-run persistence and queries

use std::collections::HashMap;

use pippy_core::{PipelineRun, RunState};

use crate::{Result, PIPELINE_RUN_PREFIX};

fn run_prefix(name: &str) -> String {
    if name.is_empty() {
        return PIPELINE_RUN_PREFIX.to_string();
    }
    format!("{PIPELINE_RUN_PREFIX}{name}/")
}

fn run_key(name: &str, id: &str) -> String {
    format!("{PIPELINE_RUN_PREFIX}{name}/{id}")
}

pub async fn get_pipeline_runs(name: &str) -> Result<Vec<PipelineRun>> {
    get_pipeline_runs_n(name, -1).await
}

/// Latest `limit` runs for `name` (empty name = all pipelines), newest
/// first by creation time. Zero or negative returns everything.
pub async fn get_pipeline_runs_n(name: &str, limit: i64) -> Result<Vec<PipelineRun>> {
    let store = pippy_store::get().await?;
    let mut runs = Vec::new();
    for (_, value) in store
        .sorted_desc_n(&run_prefix(name), "$.created", limit)
        .await?
    {
        let run: PipelineRun =
            serde_json::from_value(value).map_err(pippy_store::StoreError::from)?;
        runs.push(run);
    }
    Ok(runs)
}

pub async fn get_pipeline_run_count(name: &str) -> Result<u64> {
    let store = pippy_store::get().await?;
    Ok(store.count(&run_prefix(name)).await?)
}

/// Run counts grouped by their persisted state.
pub async fn get_pipeline_run_count_by_state(name: &str) -> Result<HashMap<String, i64>> {
    let store = pippy_store::get().await?;
    let mut counts = HashMap::new();
    for (state, count) in store.count_json_path(&run_prefix(name), "$.state").await? {
        if let Some(state) = state.as_str() {
            counts.insert(state.to_string(), count);
        }
    }
    Ok(counts)
}

pub async fn get_pipeline_run(name: &str, id: &str) -> Result<PipelineRun> {
    let store = pippy_store::get().await?;
    let run = pippy_store::load_json(store.as_ref(), &run_key(name, id)).await?;
    Ok(run)
}

pub async fn save_pipeline_run(run: &PipelineRun) -> Result<()> {
    let store = pippy_store::get().await?;
    pippy_store::save_json(store.as_ref(), &run_key(&run.pipeline_name, &run.id), run).await?;
    Ok(())
}

/// Mark a non-terminal run `Canceled`; missing runs are left alone.
pub async fn cancel_pipeline_run(name: &str, id: &str) -> Result<()> {
    let mut run = match get_pipeline_run(name, id).await {
        Ok(run) => run,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };

    if run.state != RunState::Success && run.state != RunState::Failed {
        run.state = RunState::Canceled;
        return save_pipeline_run(&run).await;
    }
    Ok(())
}

pub async fn delete_pipeline_run(name: &str, id: &str) -> Result<()> {
    let store = pippy_store::get().await?;
    match store.delete(&run_key(name, id)).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn memory_store() {
        let store = pippy_store::EmbeddedStore::in_memory().unwrap();
        pippy_store::set_default_store(Some(Arc::new(store)));
    }

    fn run_created_at(id: &str, minutes_ago: i64, state: RunState) -> PipelineRun {
        PipelineRun {
            id: id.to_string(),
            pipeline_name: "Pipeline1".to_string(),
            created: Utc::now() - Duration::minutes(minutes_ago),
            updated: Utc::now(),
            state,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_runs_sorted_newest_first_with_limit() {
        memory_store();

        for (id, age) in [("a", 30), ("b", 10), ("c", 20)] {
            save_pipeline_run(&run_created_at(id, age, RunState::Success))
                .await
                .unwrap();
        }

        let runs = get_pipeline_runs("Pipeline1").await.unwrap();
        let ids: Vec<_> = runs.iter().map(|run| run.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let limited = get_pipeline_runs_n("Pipeline1", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "b");

        assert_eq!(get_pipeline_run_count("Pipeline1").await.unwrap(), 3);

        pippy_store::set_default_store(None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_count_by_state() {
        memory_store();

        save_pipeline_run(&run_created_at("a", 1, RunState::Success)).await.unwrap();
        save_pipeline_run(&run_created_at("b", 2, RunState::Success)).await.unwrap();
        save_pipeline_run(&run_created_at("c", 3, RunState::Failed)).await.unwrap();

        let counts = get_pipeline_run_count_by_state("Pipeline1").await.unwrap();
        assert_eq!(counts.get("Success"), Some(&2));
        assert_eq!(counts.get("Failed"), Some(&1));

        pippy_store::set_default_store(None);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_cancel_skips_terminal_and_missing_runs() {
        memory_store();

        save_pipeline_run(&run_created_at("done", 1, RunState::Success)).await.unwrap();
        save_pipeline_run(&run_created_at("active", 1, RunState::InProgress)).await.unwrap();

        cancel_pipeline_run("Pipeline1", "done").await.unwrap();
        cancel_pipeline_run("Pipeline1", "active").await.unwrap();
        cancel_pipeline_run("Pipeline1", "missing").await.unwrap();

        assert_eq!(
            get_pipeline_run("Pipeline1", "done").await.unwrap().state,
            RunState::Success
        );
        assert_eq!(
            get_pipeline_run("Pipeline1", "active").await.unwrap().state,
            RunState::Canceled
        );

        pippy_store::set_default_store(None);
    }
}

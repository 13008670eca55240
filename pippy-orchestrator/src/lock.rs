//! Pipeline lock interlock
//!
//! A locked pipeline rejects all new approvals until unlocked; both
//! transitions are audit-stamped with the operator's reason.

use std::collections::HashMap;

use pippy_core::audit::{AUDIT_LOCKED, AUDIT_UNLOCKED};

use crate::{audit, pipelines, Actor, Result};

pub async fn lock_pipeline(name: &str, reason: &str, actor: &Actor) -> Result<()> {
    let mut pipeline = pipelines::get_pipeline(name).await?;
    if pipeline.locked {
        return Ok(());
    }

    let resource = HashMap::from([("Pipeline".to_string(), pipeline.name.clone())]);
    pipeline.locked = true;
    audit::save(AUDIT_LOCKED, resource, &actor.name, &actor.email, reason).await?;

    pipelines::save_pipeline(&pipeline).await
}

pub async fn unlock_pipeline(name: &str, reason: &str, actor: &Actor) -> Result<()> {
    let mut pipeline = pipelines::get_pipeline(name).await?;
    if !pipeline.locked {
        return Ok(());
    }

    let resource = HashMap::from([("Pipeline".to_string(), pipeline.name.clone())]);
    pipeline.locked = false;
    audit::save(AUDIT_UNLOCKED, resource, &actor.name, &actor.email, reason).await?;

    pipelines::save_pipeline(&pipeline).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pippy_core::Pipeline;
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

    #[tokio::test]
    #[serial_test::serial]
    async fn test_lock_unlock_round_trip_with_audit() {
        memory_store();

        pipelines::save_pipeline(&Pipeline {
            name: "Pipeline1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        lock_pipeline("Pipeline1", "release freeze", &actor()).await.unwrap();
        assert!(pipelines::get_pipeline("Pipeline1").await.unwrap().locked);

        // locking twice is a no-op and writes no second audit record
        lock_pipeline("Pipeline1", "again", &actor()).await.unwrap();
        let resource = HashMap::from([("Pipeline".to_string(), "Pipeline1".to_string())]);
        let latest = audit::latest(AUDIT_LOCKED, &resource).await.unwrap();
        assert_eq!(latest.message, "release freeze");

        unlock_pipeline("Pipeline1", "freeze over", &actor()).await.unwrap();
        assert!(!pipelines::get_pipeline("Pipeline1").await.unwrap().locked);
        let latest = audit::latest(AUDIT_UNLOCKED, &resource).await.unwrap();
        assert_eq!(latest.message, "freeze over");

        pippy_store::set_default_store(None);
    }
}

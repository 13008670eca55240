//! Audit log
//!
//! Append-only records keyed `audit:<kind>/<uuid>`; every interlock writes
//! one. Listings and latest-lookups sort on the record's `$.Time`.

use std::collections::HashMap;

use chrono::Utc;
use pippy_core::AuditRecord;
use uuid::Uuid;

use crate::Result;

pub const AUDIT_PREFIX: &str = "audit:";

/// Append one audit record of `kind` for `resource`.
pub async fn save(
    kind: &str,
    resource: HashMap<String, String>,
    actor: &str,
    email: &str,
    message: &str,
) -> Result<()> {
    let store = pippy_store::get().await?;
    let key = format!("{AUDIT_PREFIX}{kind}/{}", Uuid::new_v4());
    let record = AuditRecord {
        time: Utc::now(),
        resource,
        actor: actor.to_string(),
        email: email.to_string(),
        message: message.to_string(),
    };
    pippy_store::save_json(store.as_ref(), &key, &record).await?;
    Ok(())
}

/// Most recent record of `kind` whose resource map matches exactly.
pub async fn latest(kind: &str, resource: &HashMap<String, String>) -> Result<AuditRecord> {
    let store = pippy_store::get().await?;
    let prefix = format!("{AUDIT_PREFIX}{kind}/");

    let mut latest = AuditRecord::default();
    for (_, value) in store.sorted_desc_n(&prefix, "$.Time", -1).await? {
        let record: AuditRecord =
            serde_json::from_value(value).map_err(pippy_store::StoreError::from)?;
        if &record.resource != resource {
            continue;
        }
        if record.time >= latest.time {
            latest = record;
        }
    }
    Ok(latest)
}

pub async fn list(limit: i64) -> Result<Vec<(String, AuditRecord)>> {
    let store = pippy_store::get().await?;
    let mut records = Vec::new();
    for (key, value) in store.sorted_desc_n(AUDIT_PREFIX, "$.Time", limit).await? {
        let record: AuditRecord =
            serde_json::from_value(value).map_err(pippy_store::StoreError::from)?;
        records.push((key, record));
    }
    Ok(records)
}

/// Split an audit key into its `(kind, id)` halves.
pub fn split_key(key: &str) -> (&str, &str) {
    let stripped = key.strip_prefix(AUDIT_PREFIX).unwrap_or(key);
    stripped.split_once('/').unwrap_or((stripped, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn with_memory_store() {
        let store = pippy_store::EmbeddedStore::in_memory().unwrap();
        pippy_store::set_default_store(Some(Arc::new(store)));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_save_latest_and_list() {
        with_memory_store();

        let p1 = HashMap::from([("Pipeline".to_string(), "p1".to_string())]);
        let p2 = HashMap::from([("Pipeline".to_string(), "p2".to_string())]);

        save("Locked", p1.clone(), "octocat", "o@example.com", "freeze").await.unwrap();
        save("Locked", p2.clone(), "hubot", "h@example.com", "maintenance").await.unwrap();
        save("Locked", p1.clone(), "octocat", "o@example.com", "second freeze").await.unwrap();

        let latest = latest("Locked", &p1).await.unwrap();
        assert_eq!(latest.message, "second freeze");
        assert_eq!(latest.actor, "octocat");

        let all = list(-1).await.unwrap();
        assert_eq!(all.len(), 3);
        // newest first
        assert_eq!(all[0].1.message, "second freeze");
        let (kind, _) = split_key(&all[0].0);
        assert_eq!(kind, "Locked");

        let limited = list(1).await.unwrap();
        assert_eq!(limited.len(), 1);

        pippy_store::set_default_store(None);
    }
}

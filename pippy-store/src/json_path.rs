//! Dotted `$.field` resolution for the embedded backend
//!
//! The relational backend hands paths to `jsonb_path_query`; the embedded
//! backend only ever sees the dotted-field subset the system queries
//! (`$.created`, `$.state`, `$.Time`), resolved here.

use serde_json::Value;

use crate::{Result, StoreError};

/// Resolve `path` against `value`. Returns `None` when any segment is
/// missing, which drops the entry from sorted/grouped scans.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    let fields = path
        .strip_prefix("$.")
        .ok_or_else(|| StoreError::JsonPath(path.to_string()))?;

    let mut current = value;
    for field in fields.split('.') {
        match current.get(field) {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Ordering key for a resolved value: its JSON text. Timestamps serialize
/// as RFC 3339 strings, so lexicographic order is chronological order.
pub(crate) fn sort_key(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_field() {
        let value = json!({"state": "Success", "trigger": {"login": "octocat"}});
        assert_eq!(
            lookup(&value, "$.state").unwrap(),
            Some(&json!("Success"))
        );
        assert_eq!(
            lookup(&value, "$.trigger.login").unwrap(),
            Some(&json!("octocat"))
        );
        assert_eq!(lookup(&value, "$.missing").unwrap(), None);
    }

    #[test]
    fn test_lookup_rejects_non_dotted_path() {
        let value = json!({});
        assert!(lookup(&value, "state").is_err());
    }
}

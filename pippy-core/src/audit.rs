//! Audit record types
//!
//! Append-only events keyed `audit:<kind>/<uuid>`, one per operator action.
//! Field names are PascalCase on the wire; listings sort on `$.Time`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit kinds written by the interlocks
pub const AUDIT_LOCKED: &str = "Locked";
pub const AUDIT_UNLOCKED: &str = "Unlocked";
pub const AUDIT_PAUSED: &str = "Paused";
pub const AUDIT_RESUMED: &str = "Resumed";
pub const AUDIT_APPROVED: &str = "Approved";
pub const AUDIT_CANCEL_APPROVAL: &str = "CancelApproval";

/// One audit event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditRecord {
    pub time: DateTime<Utc>,
    /// Resource map, e.g. `{Pipeline: p, PipelineRun: r}`
    pub resource: HashMap<String, String>,
    pub actor: String,
    pub email: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_field_names() {
        let record = AuditRecord {
            time: Utc::now(),
            resource: HashMap::from([("Pipeline".to_string(), "p1".to_string())]),
            actor: "octocat".to_string(),
            email: "octocat@example.com".to_string(),
            message: "locked for release freeze".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("Time").is_some());
        assert_eq!(value["Resource"]["Pipeline"], "p1");
        assert_eq!(value["Actor"], "octocat");
    }
}

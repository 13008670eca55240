//! Client and entity-target state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed state of one orchestrated entity, as reported by the caller on
/// every tick; the engine answers with the desired target state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// Last message recorded for a target version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl Message {
    pub fn success(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.timestamp = Utc::now();
        self.is_error = false;
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.timestamp = Utc::now();
        self.is_error = true;
    }
}

/// Operator-supplied target version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTargetVersion {
    #[serde(default)]
    pub version: String,
}

/// A version plus when it was assigned and the last message about it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityVersionInfo {
    #[serde(default)]
    pub version: String,
    /// When this version was switched to
    #[serde(rename = "changetimestamp", default)]
    pub change_timestamp: DateTime<Utc>,
    #[serde(rename = "lastmessage", default)]
    pub last_message: Message,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTargetState {
    #[serde(rename = "currentversion", default)]
    pub current_version: EntityVersionInfo,
    #[serde(rename = "targetversion", default)]
    pub target_version: EntityVersionInfo,
    #[serde(rename = "lastupdatedtimestamp", default)]
    pub last_updated: DateTime<Utc>,
}

/// One orchestrated target, uniquely identified by (group, name)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTarget {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub state: EntityTargetState,
}

impl EntityTarget {
    /// Desired state handed back to the client for this target.
    pub(crate) fn to_client_state(&self) -> ClientState {
        ClientState {
            name: self.name.clone(),
            group: self.group.clone(),
            tags: String::new(),
            version: self.state.target_version.version.clone(),
            message: self.state.target_version.last_message.message.clone(),
            is_error: self.state.target_version.last_message.is_error,
        }
    }

    /// Same, with the message stamped for reporting back to callers.
    pub(crate) fn to_reported_state(&self) -> ClientState {
        let mut client = self.to_client_state();
        client.message = format!(
            "{} at {}",
            self.state.target_version.last_message.message,
            self.state.target_version.last_message.timestamp
        );
        client
    }

    pub(crate) fn matches(&self, name: &str, group: &str) -> bool {
        self.name == name && self.group == group
    }
}

//! Datadog monitoring hook
//!
//! Installed on a stage's rollout entity when the stage carries an
//! external-monitor configuration. Any monitor in `alert` state fails the
//! whole in-rollout batch.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use pippy_core::DatadogInfo;
use pippy_rollout::{ClientState, MonitoringController, RolloutError};

pub struct DatadogMonitor {
    info: DatadogInfo,
}

impl DatadogMonitor {
    pub fn new(info: DatadogInfo) -> Self {
        Self { info }
    }
}

#[derive(Debug, Deserialize)]
struct MonitorState {
    #[serde(default)]
    name: String,
    #[serde(default)]
    overall_state: String,
    #[serde(default)]
    overall_state_modified: String,
}

#[async_trait]
impl MonitoringController for DatadogMonitor {
    async fn external_monitoring(
        &self,
        _targets: &[ClientState],
    ) -> std::result::Result<(), RolloutError> {
        let client = reqwest::Client::new();
        for monitor in &self.info.monitors {
            let monitor_id: i64 = monitor
                .parse()
                .map_err(|_| RolloutError::Monitoring(format!("failed to parse monitor {monitor}")))?;

            let url = format!(
                "https://api.{}/api/v1/monitor/{}?group_states=all&with_downtimes=true",
                self.info.site, monitor_id
            );
            let response = client
                .get(&url)
                .header("Accept", "application/json")
                .header("DD-API-KEY", &self.info.api_key)
                .header("DD-APPLICATION-KEY", &self.info.application_key)
                .send()
                .await
                .map_err(|err| RolloutError::Monitoring(format!("received error from datadog {err}")))?;

            if !response.status().is_success() {
                return Err(RolloutError::Monitoring(format!(
                    "datadog returned {} for monitor {monitor}",
                    response.status()
                )));
            }

            let state: MonitorState = response
                .json()
                .await
                .map_err(|err| RolloutError::Monitoring(format!("failed to decode datadog response {err}")))?;

            debug!(monitor = %state.name, state = %state.overall_state, "checked datadog monitor");

            if state.overall_state.eq_ignore_ascii_case("alert") {
                return Err(RolloutError::Monitoring(format!(
                    "monitor {monitor} in alert state since {}",
                    state.overall_state_modified
                )));
            }
        }
        Ok(())
    }
}

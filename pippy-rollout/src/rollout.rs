//! Rollout state machine
//!
//! One tick: partition targets by expected version, monitor the in-rollout
//! batch, fold outcomes into LKG/LKB, retire targets on the losing version,
//! select and version the next batch, then promote the rolling version when
//! the success threshold is met.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{MonitoringController, TargetController};
use crate::engine::Entity;
use crate::target::{ClientState, EntityTarget};
use crate::{Result, RolloutError};

/// Knobs for one entity's rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutOptions {
    /// Percentage of targets in rollout at once
    #[serde(rename = "batchpercent", default)]
    pub batch_percent: i64,
    /// Percentage of successful targets that marks the rollout successful
    #[serde(rename = "successpercent", default)]
    pub success_percent: i64,
    /// Monitoring window a target must stay healthy for
    #[serde(rename = "successtimeoutsecs", default)]
    pub success_timeout_secs: i64,
    /// Max time a target may take to reach a healthy window
    #[serde(rename = "durationtimeoutsecs", default)]
    pub duration_timeout_secs: i64,
}

impl Default for RolloutOptions {
    /// Conservative settings
    fn default() -> Self {
        Self {
            batch_percent: 5,
            success_percent: 100,
            success_timeout_secs: 60,
            duration_timeout_secs: 120,
        }
    }
}

/// Persisted rollout bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    #[serde(rename = "targetversion", default)]
    pub target_version: String,
    #[serde(rename = "rollingversion", default)]
    pub rolling_version: String,
    #[serde(rename = "lastknowngoodversion", default)]
    pub last_known_good_version: String,
    #[serde(rename = "lastknownbadversion", default)]
    pub last_known_bad_version: String,
    #[serde(default)]
    pub options: RolloutOptions,
}

impl RolloutState {
    /// Record a new target version. With `force`, the current rolling
    /// version is stamped as last-known-bad when it is neither the LKG nor
    /// the new target, which unblocks a stuck rollout.
    pub fn set_target_version(&mut self, version: &str, force: bool) {
        info!(target_version = version, force, "setting target version");
        self.target_version = version.to_string();
        if force
            && !self
                .rolling_version
                .eq_ignore_ascii_case(&self.last_known_good_version)
            && !self.rolling_version.eq_ignore_ascii_case(version)
        {
            self.last_known_bad_version = self.rolling_version.clone();
        }
    }

    pub fn set_options(&mut self, options: Option<RolloutOptions>) {
        self.options = options.unwrap_or_default();
    }
}

/// Per-tick working set; the membership lists index into `total`.
#[derive(Default)]
pub(crate) struct RolloutInfo {
    pub total: Vec<EntityTarget>,
    pub in_rollout: Vec<usize>,
    pub available: Vec<usize>,
    pub success: Vec<usize>,
    pub failed: Vec<usize>,
}

fn add_index(list: &mut Vec<usize>, index: usize) {
    if !list.contains(&index) {
        list.push(index);
    }
}

fn remove_index(list: &mut Vec<usize>, index: usize) {
    list.retain(|&i| i != index);
}

fn client_states(info: &RolloutInfo, indices: &[usize]) -> Vec<ClientState> {
    indices
        .iter()
        .map(|&i| info.total[i].to_client_state())
        .collect()
}

pub(crate) struct Rollout<'a> {
    pub state: RolloutState,
    entity: &'a Entity<'a>,
    target_controller: Arc<dyn TargetController>,
    monitoring_controller: Arc<dyn MonitoringController>,
}

impl<'a> Rollout<'a> {
    pub(crate) fn new(
        state: RolloutState,
        entity: &'a Entity<'a>,
        target_controller: Arc<dyn TargetController>,
        monitoring_controller: Arc<dyn MonitoringController>,
    ) -> Self {
        Self {
            state,
            entity,
            target_controller,
            monitoring_controller,
        }
    }

    /// The version in-rollout targets are expected to reach: the rolling
    /// version, or LKG when the rolling version went bad (rollback).
    fn expected_version(&self) -> String {
        if self.state.rolling_version == self.state.last_known_bad_version {
            return self.state.last_known_good_version.clone();
        }
        self.state.rolling_version.clone()
    }

    fn success_threshold(&self, total: usize) -> i64 {
        (self.state.options.success_percent * total as i64) / 100
    }

    fn update_last_known_versions(&mut self, info: &RolloutInfo) {
        let success_threshold = self.success_threshold(info.total.len());
        let mut failure_threshold = info.total.len() as i64 - success_threshold;
        if failure_threshold <= 0 {
            failure_threshold = 1;
        }

        if info.failed.len() as i64 >= failure_threshold {
            if self.state.rolling_version != self.state.last_known_good_version {
                self.state.last_known_bad_version = self.state.rolling_version.clone();
            }
            return;
        }

        if (info.success.len() as i64) < success_threshold {
            return;
        }

        if self.state.rolling_version != self.state.last_known_bad_version {
            self.state.last_known_good_version = self.state.rolling_version.clone();
        }
    }

    fn update_rolling_version(&mut self, info: &RolloutInfo) {
        let success_threshold = self.success_threshold(info.total.len());

        if (info.success.len() as i64) < success_threshold
            && !self
                .state
                .rolling_version
                .eq_ignore_ascii_case(&self.state.last_known_good_version)
            && !self
                .state
                .rolling_version
                .eq_ignore_ascii_case(&self.state.last_known_bad_version)
        {
            return;
        }

        info!(
            rolling_version = %self.state.rolling_version,
            target_version = %self.state.target_version,
            "updating rolling version to new target version"
        );
        self.state.rolling_version = self.state.target_version.clone();
    }

    /// Fold outcomes into LKG/LKB; when the bad version flipped, the rest
    /// of this tick is abandoned and the new state persisted.
    fn is_state_changed(&mut self, info: &RolloutInfo) -> bool {
        let bad_before = self.state.last_known_bad_version.clone();
        self.update_last_known_versions(info);

        if bad_before != self.state.last_known_bad_version {
            info!(
                previous = %bad_before,
                last_known_bad_version = %self.state.last_known_bad_version,
                "rollout state changed, last known bad version updated"
            );
            return true;
        }
        false
    }

    fn determine_current_state(&self, info: &mut RolloutInfo) {
        let expected = self.expected_version();

        debug!(total = info.total.len(), "determining current rollout state of targets");
        for index in 0..info.total.len() {
            if info.total[index].state.target_version.version != expected {
                add_index(&mut info.available, index);
            } else {
                add_index(&mut info.in_rollout, index);
            }
        }
        debug!(
            available = info.available.len(),
            in_rollout = info.in_rollout.len(),
            "partitioned targets"
        );
    }

    async fn monitor_targets(&mut self, info: &mut RolloutInfo) -> Result<()> {
        let expected = self.expected_version();

        let in_rollout_states = client_states(info, &info.in_rollout);
        self.monitoring_controller
            .external_monitoring(&in_rollout_states)
            .await?;

        for index in info.in_rollout.clone() {
            let client = info.total[index].to_client_state();
            let target = &mut info.total[index];

            if target.state.current_version.version == expected {
                if let Err(err) = self.target_controller.target_monitoring(&client).await {
                    warn!(target = %target.name, version = %expected, error = %err, "target failed monitoring");
                    target
                        .state
                        .target_version
                        .last_message
                        .error(format!("Monitoring Failed {err}"));
                    self.entity.save_entity_target(target).await?;
                    add_index(&mut info.failed, index);
                    remove_index(&mut info.in_rollout, index);
                    continue;
                }

                if !target.state.current_version.last_message.is_error {
                    let now = Utc::now();
                    let quiet =
                        (now - target.state.current_version.last_message.timestamp).num_seconds();
                    let since_update = (now - target.state.last_updated).num_seconds();
                    // healthy for the whole window, with a report inside it
                    if quiet > self.state.options.success_timeout_secs && since_update <= quiet {
                        info!(target = %target.name, "monitoring successful");
                        let message = format!(
                            "monitoring successful, success since {}",
                            target.state.current_version.last_message.timestamp
                        );
                        target.state.target_version.last_message.success(message);
                        self.entity.save_entity_target(target).await?;
                        add_index(&mut info.success, index);
                        remove_index(&mut info.in_rollout, index);
                        continue;
                    }
                }
            }

            if target.state.target_version.version == expected {
                let assigned =
                    (Utc::now() - target.state.target_version.change_timestamp).num_seconds();
                if assigned > self.state.options.duration_timeout_secs {
                    let message = format!(
                        "failed monitoring, no success message since {}, last message at {}",
                        target.state.target_version.change_timestamp,
                        target.state.current_version.last_message.timestamp
                    );
                    warn!(target = %target.name, "failed monitoring, no success message");
                    target.state.target_version.last_message.error(message);
                    self.entity.save_entity_target(target).await?;
                    add_index(&mut info.failed, index);
                    remove_index(&mut info.in_rollout, index);
                }
            }
        }

        Ok(())
    }

    fn batch_size(&self, total: usize) -> i64 {
        let batch = (self.state.options.batch_percent * total as i64) / 100;
        if batch <= 0 {
            return 1;
        }
        batch
    }

    async fn remove_targets(&mut self, info: &mut RolloutInfo) -> Result<()> {
        let batch = self.batch_size(info.total.len());

        let mut keep_version = self.state.rolling_version.clone();
        let mut count =
            info.success.len() as i64 + info.failed.len() as i64 - info.in_rollout.len() as i64;
        if count > batch {
            count = batch;
        }

        if self.state.rolling_version == self.state.last_known_bad_version {
            info!("rolling back to last known good version");
            keep_version = self.state.last_known_good_version.clone();
        }

        if count <= 0 {
            return Ok(());
        }

        let remove_candidates: Vec<ClientState> = info
            .total
            .iter()
            .filter(|target| target.state.current_version.version != keep_version)
            .map(|target| target.to_client_state())
            .collect();

        if remove_candidates.is_empty() {
            return Ok(());
        }

        info!(keep = %keep_version, count, "retiring targets off the kept version");
        let removed = self
            .target_controller
            .target_removal(remove_candidates, count as usize)
            .await?;

        // Removal only trims the persisted targets; the tick keeps working
        // on its current membership lists.
        for client in removed {
            self.entity.delete_entity_target(&client).await?;
        }

        Ok(())
    }

    async fn select_targets(&mut self, info: &mut RolloutInfo) -> Result<()> {
        let batch = self.batch_size(info.total.len());

        debug!(in_rollout = info.in_rollout.len(), batch, "selecting next batch");

        if info.in_rollout.len() as i64 >= batch {
            info.available.clear();
            return Ok(());
        }

        let mut slots = batch - info.in_rollout.len() as i64;
        if info.available.is_empty() || slots <= 0 {
            info.available.clear();
            return Ok(());
        }

        let candidates = client_states(info, &info.available);
        let picked = match self
            .target_controller
            .target_selection(candidates, slots as usize)
            .await
        {
            Ok(picked) => picked,
            Err(_) => {
                info.available.clear();
                return Ok(());
            }
        };

        let mut selected = Vec::new();
        for pick in picked {
            if slots <= 0 {
                break;
            }
            let known = info
                .available
                .iter()
                .copied()
                .find(|&i| info.total[i].matches(&pick.name, &pick.group));
            match known {
                Some(index) => {
                    add_index(&mut selected, index);
                    slots -= 1;
                }
                None => {
                    let target = self.entity.find_or_create_target(&pick, &self.state).await?;
                    info.total.push(target);
                    add_index(&mut selected, info.total.len() - 1);
                }
            }
        }

        info.available = selected;
        Ok(())
    }

    async fn rollout_new_targets(&mut self, info: &mut RolloutInfo) -> Result<()> {
        if info.available.is_empty() {
            debug!("no available targets");
            return Ok(());
        }

        let mut version = self.state.rolling_version.clone();
        let mut message = format!("Rollout new version {version}");

        if version == self.state.last_known_good_version {
            message = format!("Setting LKG to version {version}");
        }
        if version == self.state.last_known_bad_version {
            version = self.state.last_known_good_version.clone();
            message = format!("Rolling back to lkg version {version}");
        }

        let approved = match self
            .target_controller
            .target_approval(client_states(info, &info.available))
            .await
        {
            Ok(approved) => approved,
            Err(_) => return Ok(()),
        };

        info!(version = %version, approved = approved.len(), "assigning version to approved targets");

        for approval in approved {
            for &index in &info.available {
                let target = &mut info.total[index];
                if !target.matches(&approval.name, &approval.group) {
                    continue;
                }
                if target.state.target_version.version != version {
                    debug!(target = %target.name, version = %version, "assigning version to target");
                    target.state.target_version.version = version.clone();
                    target.state.target_version.change_timestamp = Utc::now();
                    target.state.target_version.last_message.success(message.clone());
                    self.entity.save_entity_target(target).await?;
                }
            }
        }

        Ok(())
    }

    /// One reconciliation pass over the entity's targets.
    pub(crate) async fn orchestrate(&mut self, targets: Vec<EntityTarget>) -> Result<()> {
        if self.state.rolling_version.is_empty() {
            self.state.rolling_version = self.state.target_version.clone();
        }
        if self.state.rolling_version.is_empty() {
            return Err(RolloutError::EmptyTargetVersion);
        }

        info!(
            rolling_version = %self.state.rolling_version,
            last_known_good_version = %self.state.last_known_good_version,
            last_known_bad_version = %self.state.last_known_bad_version,
            "starting rollout tick"
        );

        let mut info = RolloutInfo {
            total: targets,
            ..Default::default()
        };

        self.determine_current_state(&mut info);
        self.monitor_targets(&mut info).await?;

        if self.is_state_changed(&info) {
            return Ok(());
        }

        self.remove_targets(&mut info).await?;
        self.select_targets(&mut info).await?;
        self.rollout_new_targets(&mut info).await?;

        self.update_last_known_versions(&info);
        self.update_rolling_version(&info);

        Ok(())
    }
}

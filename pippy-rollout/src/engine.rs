//! Engine: namespaces, entities and their persisted targets
//!
//! Namespace
//! | - Entity
//!     | - Target
//!
//! The engine owns its own store handle (separate from the application
//! store) and an in-memory registry of controller hooks, re-registered by
//! the caller per run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pippy_store::{EmbeddedStore, PgStore, Store};

use crate::controller::{
    MonitoringController, NoOpMonitoringController, NoOpTargetController, TargetController,
};
use crate::rollout::{Rollout, RolloutOptions, RolloutState};
use crate::target::{ClientState, EntityTarget, EntityTargetVersion, EntityVersionInfo, Message};
use crate::{Result, RolloutError};

const NAMESPACE_PREFIX: &str = "namespace:";
const ENTITY_PREFIX: &str = "entity:";
const ROLLOUT_PREFIX: &str = "rollout:";
const ENTITY_TARGET_PREFIX: &str = "entitytarget:";

/// Targets that stop reporting are deleted after this long.
const ZOMBIE_TARGET_TIMEOUT_SECS: i64 = 900;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used in log fields
    pub application_name: String,
    /// Use the relational store when non-empty
    pub store_database_url: String,
    pub store_database_schema: String,
    pub store_database_table: String,
    /// Embedded store location; `None` keeps the engine in memory
    pub store_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            store_database_url: String::new(),
            store_database_schema: pippy_store::PUBLIC_SCHEMA.to_string(),
            store_database_table: "orchestrator".to_string(),
            store_directory: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceRecord {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntityRecord {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RolloutRecord {
    #[serde(default)]
    state: RolloutState,
}

/// Rollout engine over one store
pub struct Engine {
    store: Arc<dyn Store>,
    target_controllers: RwLock<HashMap<String, Arc<dyn TargetController>>>,
    monitoring_controllers: RwLock<HashMap<String, Arc<dyn MonitoringController>>>,
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self> {
        let store: Arc<dyn Store> = if !config.store_database_url.is_empty() {
            Arc::new(
                PgStore::connect(
                    &config.store_database_url,
                    &config.store_database_schema,
                    &config.store_database_table,
                )
                .await?,
            )
        } else if let Some(dir) = &config.store_directory {
            Arc::new(EmbeddedStore::open(dir)?)
        } else {
            Arc::new(EmbeddedStore::in_memory()?)
        };

        info!(application = %config.application_name, "creating orchestrator engine");

        Ok(Self {
            store,
            target_controllers: RwLock::new(HashMap::new()),
            monitoring_controllers: RwLock::new(HashMap::new()),
        })
    }

    fn entity<'e>(&'e self, namespace: &str, name: &str) -> Entity<'e> {
        Entity {
            namespace: namespace.to_string(),
            name: name.to_string(),
            engine: self,
        }
    }

    async fn ensure_registered(&self, namespace: &str, name: &str) -> Result<()> {
        let namespace_key = format!("{NAMESPACE_PREFIX}{namespace}");
        match self.store.load_value(&namespace_key).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                info!(namespace, "creating new namespace");
                let record = NamespaceRecord {
                    name: namespace.to_string(),
                };
                pippy_store::save_json(self.store.as_ref(), &namespace_key, &record).await?;
            }
            Err(err) => return Err(err.into()),
        }

        let entity_key = format!("{ENTITY_PREFIX}{namespace}/{name}");
        match self.store.load_value(&entity_key).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                info!(namespace, entity = name, "creating new entity");
                let record = EntityRecord {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                };
                pippy_store::save_json(self.store.as_ref(), &entity_key, &record).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn controller_key(namespace: &str, entity: &str) -> String {
        format!("{namespace}/{entity}")
    }

    fn target_controller(&self, namespace: &str, entity: &str) -> Arc<dyn TargetController> {
        self.target_controllers
            .read()
            .expect("controller lock poisoned")
            .get(&Self::controller_key(namespace, entity))
            .cloned()
            .unwrap_or_else(|| Arc::new(NoOpTargetController))
    }

    fn monitoring_controller(
        &self,
        namespace: &str,
        entity: &str,
    ) -> Arc<dyn MonitoringController> {
        self.monitoring_controllers
            .read()
            .expect("controller lock poisoned")
            .get(&Self::controller_key(namespace, entity))
            .cloned()
            .unwrap_or_else(|| Arc::new(NoOpMonitoringController))
    }

    /// Override the target controller for an entity.
    pub fn set_target_controller(
        &self,
        namespace: &str,
        entity: &str,
        controller: Arc<dyn TargetController>,
    ) {
        self.target_controllers
            .write()
            .expect("controller lock poisoned")
            .insert(Self::controller_key(namespace, entity), controller);
    }

    /// Hook an external monitoring system up to an entity.
    pub fn set_monitoring_controller(
        &self,
        namespace: &str,
        entity: &str,
        controller: Arc<dyn MonitoringController>,
    ) {
        self.monitoring_controllers
            .write()
            .expect("controller lock poisoned")
            .insert(Self::controller_key(namespace, entity), controller);
    }

    /// Set the version the rollout should converge on.
    pub async fn set_target_version(
        &self,
        namespace: &str,
        entity: &str,
        target_version: EntityTargetVersion,
    ) -> Result<()> {
        self.apply_target_version(namespace, entity, target_version, false)
            .await
    }

    /// Set the target version and mark the current rolling version as bad,
    /// allowing the new target to take over a stuck rollout.
    pub async fn force_target_version(
        &self,
        namespace: &str,
        entity: &str,
        target_version: EntityTargetVersion,
    ) -> Result<()> {
        self.apply_target_version(namespace, entity, target_version, true)
            .await
    }

    async fn apply_target_version(
        &self,
        namespace: &str,
        entity: &str,
        target_version: EntityTargetVersion,
        force: bool,
    ) -> Result<()> {
        if target_version.version.is_empty() {
            return Err(RolloutError::InvalidTargetVersion);
        }

        self.ensure_registered(namespace, entity).await?;
        let entity = self.entity(namespace, entity);
        let mut state = entity.load_rollout_state().await?;
        state.set_target_version(&target_version.version, force);
        entity.save_rollout_state(&state).await
    }

    /// Set rollout options; callers typically do this before orchestrating.
    pub async fn set_rollout_options(
        &self,
        namespace: &str,
        entity: &str,
        options: Option<RolloutOptions>,
    ) -> Result<()> {
        self.ensure_registered(namespace, entity).await?;
        let entity = self.entity(namespace, entity);
        let mut state = entity.load_rollout_state().await?;
        state.set_options(options);
        entity.save_rollout_state(&state).await
    }

    /// Record the observed target states, run one rollout tick and return
    /// the desired state for every known target.
    pub async fn orchestrate(
        &self,
        namespace: &str,
        entity_name: &str,
        targets: &[ClientState],
    ) -> Result<Vec<ClientState>> {
        self.ensure_registered(namespace, entity_name).await?;
        let entity = self.entity(namespace, entity_name);

        debug!(namespace, entity = entity_name, "refreshing target state");
        entity.update_entity_targets(targets).await?;

        let state = entity.load_rollout_state().await?;
        let mut rollout = Rollout::new(
            state,
            &entity,
            self.target_controller(namespace, entity_name),
            self.monitoring_controller(namespace, entity_name),
        );

        let entity_targets = entity.get_entity_targets().await?;
        rollout.orchestrate(entity_targets).await?;
        entity.save_rollout_state(&rollout.state).await?;

        entity.return_client_state().await
    }

    /// Current rollout bookkeeping for an entity.
    pub async fn get_rollout_info(&self, namespace: &str, entity: &str) -> Result<RolloutState> {
        self.entity(namespace, entity).load_rollout_state().await
    }
}

/// One named entity inside a namespace, borrowed from the engine.
pub(crate) struct Entity<'e> {
    namespace: String,
    name: String,
    engine: &'e Engine,
}

impl<'e> Entity<'e> {
    fn store(&self) -> &dyn Store {
        self.engine.store.as_ref()
    }

    fn rollout_key(&self) -> String {
        format!("{ROLLOUT_PREFIX}{}/{}", self.namespace, self.name)
    }

    fn target_key(&self, group: &str, name: &str) -> String {
        format!(
            "{ENTITY_TARGET_PREFIX}{}/{}/{}/{}",
            self.namespace, self.name, group, name
        )
    }

    fn target_prefix(&self, group: &str) -> String {
        format!("{ENTITY_TARGET_PREFIX}{}/{}/{group}", self.namespace, self.name)
    }

    pub(crate) async fn load_rollout_state(&self) -> Result<RolloutState> {
        match pippy_store::load_json::<RolloutRecord>(self.store(), &self.rollout_key()).await {
            Ok(record) => Ok(record.state),
            Err(err) if err.is_not_found() => {
                info!(namespace = %self.namespace, entity = %self.name, "creating new rollout");
                let record = RolloutRecord::default();
                pippy_store::save_json(self.store(), &self.rollout_key(), &record).await?;
                Ok(record.state)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn save_rollout_state(&self, state: &RolloutState) -> Result<()> {
        let record = RolloutRecord {
            state: state.clone(),
        };
        pippy_store::save_json(self.store(), &self.rollout_key(), &record).await?;
        Ok(())
    }

    pub(crate) async fn get_entity_targets(&self) -> Result<Vec<EntityTarget>> {
        let values = self.store().load_values(&self.target_prefix("")).await?;
        values
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_value(value).map_err(pippy_store::StoreError::from)?))
            .collect()
    }

    pub(crate) async fn save_entity_target(&self, target: &EntityTarget) -> Result<()> {
        pippy_store::save_json(
            self.store(),
            &self.target_key(&target.group, &target.name),
            target,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn delete_entity_target(&self, client: &ClientState) -> Result<()> {
        self.store()
            .delete(&self.target_key(&client.group, &client.name))
            .await?;
        Ok(())
    }

    /// Load the target for `client`, creating it with the current LKG as
    /// its assigned version when it has never been seen before.
    pub(crate) async fn find_or_create_target(
        &self,
        client: &ClientState,
        rollout_state: &RolloutState,
    ) -> Result<EntityTarget> {
        let key = self.target_key(&client.group, &client.name);
        match pippy_store::load_json::<EntityTarget>(self.store(), &key).await {
            Ok(target) => Ok(target),
            Err(err) if err.is_not_found() => {
                info!(
                    name = %client.name,
                    group = %client.group,
                    version = %client.version,
                    is_error = client.is_error,
                    "creating new target"
                );
                let now = Utc::now();
                let backdated = now - Duration::seconds(rollout_state.options.success_timeout_secs);
                let target = EntityTarget {
                    name: client.name.clone(),
                    group: client.group.clone(),
                    tags: client.tags.clone(),
                    state: crate::target::EntityTargetState {
                        current_version: EntityVersionInfo {
                            version: client.version.clone(),
                            change_timestamp: backdated,
                            last_message: Message {
                                message: client.message.clone(),
                                timestamp: now,
                                is_error: client.is_error,
                            },
                        },
                        target_version: EntityVersionInfo {
                            version: rollout_state.last_known_good_version.clone(),
                            change_timestamp: backdated,
                            last_message: Message {
                                message: "new target, setting lkg".to_string(),
                                timestamp: now,
                                is_error: false,
                            },
                        },
                        last_updated: now,
                    },
                };
                self.save_entity_target(&target).await?;
                Ok(target)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fold the reported client states into the persisted targets and drop
    /// targets that have stopped reporting.
    pub(crate) async fn update_entity_targets(&self, targets: &[ClientState]) -> Result<()> {
        let rollout_state = self.load_rollout_state().await?;
        for client in targets {
            let mut target = self.find_or_create_target(client, &rollout_state).await?;
            debug!(
                name = %client.name,
                version = %client.version,
                is_error = client.is_error,
                "updating target"
            );
            copy_client_state(client, &mut target);
            self.save_entity_target(&target).await?;
        }

        for target in self.get_entity_targets().await? {
            if (Utc::now() - target.state.last_updated).num_seconds() > ZOMBIE_TARGET_TIMEOUT_SECS {
                self.store()
                    .delete(&self.target_key(&target.group, &target.name))
                    .await?;
            }
        }
        Ok(())
    }

    /// Desired client state for every known target.
    pub(crate) async fn return_client_state(&self) -> Result<Vec<ClientState>> {
        Ok(self
            .get_entity_targets()
            .await?
            .iter()
            .map(EntityTarget::to_reported_state)
            .collect())
    }
}

/// Record what the client reported. The message timestamp only moves when
/// the error bit flips or the version changes, which is what the monitoring
/// window measures against.
fn copy_client_state(client: &ClientState, target: &mut EntityTarget) {
    let now = Utc::now();
    target.state.last_updated = now;
    let current = &mut target.state.current_version;
    if current.last_message.is_error != client.is_error || current.version != client.version {
        current.last_message.timestamp = now;
    }
    if current.version != client.version {
        current.change_timestamp = now;
        current.version = client.version.clone();
    }
    current.last_message.message = client.message.clone();
    current.last_message.is_error = client.is_error;
}

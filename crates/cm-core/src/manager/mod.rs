//! Environment manager - coordinates runtime, ledger and networks
//!
//! Every operation resolves its environment through [`EnvironmentManager::get`],
//! which reconciles the ledger with what the runtime reports before anything
//! else happens. The ledger is only ever touched through the [`StateStore`].

mod exec;
mod lifecycle;
mod links;

pub use exec::ShellTarget;

use crate::{
    reconcile_status, CoreError, Environment, EnvironmentStatus, ErrorCode, FileStateStore,
    LiveState, NetworkManager, Result, StateStore,
};
use cm_config::{ConfigLoader, DevcontainerLoader, GlobalConfig};
use cm_provider::{ContainerId, ContainerProvider, ProviderType};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Options for [`EnvironmentManager::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    /// Defaults to the current directory
    pub project_dir: Option<PathBuf>,
    /// Used when the project has no devcontainer.json
    pub template: Option<String>,
    /// Ports to publish in addition to the configuration's forwardPorts
    pub expose_ports: Vec<u16>,
    /// Environments to link with once created
    pub link_to: Vec<String>,
    pub gpus: Vec<u32>,
    pub gpu_count: Option<u32>,
    /// e.g. `512m`, `8g`
    pub memory: Option<String>,
    pub cpu: Option<f64>,
    /// Record the environment without provisioning its container
    pub no_start: bool,
    /// Replace an existing environment of the same name
    pub force: bool,
    pub labels: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl CreateOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Sort order for [`EnvironmentManager::list`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Name,
    Created,
}

impl std::str::FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "created" => Ok(Self::Created),
            other => Err(format!("unknown sort field: {}", other)),
        }
    }
}

/// Filters and ordering for [`EnvironmentManager::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<EnvironmentStatus>,
    pub project: Option<PathBuf>,
    pub tag: Option<String>,
    pub sort_by: SortBy,
    pub desc: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Record the link on both environments
    pub bidirectional: bool,
}

/// Main environment manager
pub struct EnvironmentManager {
    provider: Arc<dyn ContainerProvider>,
    store: Arc<dyn StateStore>,
    loader: Arc<dyn ConfigLoader>,
    networks: NetworkManager,
    global_config: GlobalConfig,
}

impl EnvironmentManager {
    pub fn new(
        provider: Arc<dyn ContainerProvider>,
        store: Arc<dyn StateStore>,
        loader: Arc<dyn ConfigLoader>,
        global_config: GlobalConfig,
    ) -> Self {
        let networks = NetworkManager::new(provider.clone());
        Self {
            provider,
            store,
            loader,
            networks,
            global_config,
        }
    }

    /// Connect to the configured runtime and open the default ledger
    pub async fn connect(
        global_config: GlobalConfig,
        requested: Option<ProviderType>,
    ) -> Result<Self> {
        let provider = cm_provider::create_default_provider(&global_config, requested).await?;
        let store = FileStateStore::open_default()?;
        debug!("Using ledger at {}", store.path().display());

        Ok(Self::new(
            Arc::from(provider),
            Arc::new(store),
            Arc::new(DevcontainerLoader::new()),
            global_config,
        ))
    }

    /// Create a manager for testing with injectable dependencies
    #[cfg(any(test, feature = "test-support"))]
    pub fn new_for_testing(
        provider: Arc<dyn ContainerProvider>,
        store: Arc<dyn StateStore>,
        loader: Arc<dyn ConfigLoader>,
    ) -> Self {
        Self::new(provider, store, loader, GlobalConfig::default())
    }

    pub fn provider(&self) -> &dyn ContainerProvider {
        self.provider.as_ref()
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn networks(&self) -> &NetworkManager {
        &self.networks
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global_config
    }

    /// Look up by ID, then by name, and reconcile with the runtime
    pub async fn get(&self, name_or_id: &str) -> Result<Environment> {
        let env = match self.store.load(name_or_id) {
            Ok(env) => env,
            Err(e) if e.is(ErrorCode::EnvNotFound) => self
                .store
                .get_by_name(name_or_id)
                .map_err(|_| CoreError::env_not_found(name_or_id))?,
            Err(e) => return Err(e),
        };
        self.sync_status(env).await
    }

    /// Reconcile one environment explicitly
    pub async fn sync(&self, name_or_id: &str) -> Result<Environment> {
        self.get(name_or_id).await
    }

    pub async fn exists(&self, name_or_id: &str) -> bool {
        self.get(name_or_id).await.is_ok()
    }

    /// Bring a record in line with its container, persisting any change
    ///
    /// An unreachable runtime leaves the record as stored.
    pub(crate) async fn sync_status(&self, mut env: Environment) -> Result<Environment> {
        let live = match env.container_id.clone() {
            None => LiveState::Missing,
            Some(id) => match self.provider.inspect(&ContainerId::new(id)).await {
                Ok(details) => LiveState::from(details.status),
                Err(e) if e.is_not_found() => LiveState::Missing,
                Err(e) => {
                    debug!("Cannot inspect container of {}: {}", env.name, e);
                    return Ok(env);
                }
            },
        };

        let reconciled = reconcile_status(env.status, env.container_id.is_some(), live);
        if reconciled.status == env.status && !reconciled.clear_container {
            return Ok(env);
        }

        debug!(
            "Reconciled {}: {} -> {}",
            env.name, env.status, reconciled.status
        );
        env.status = reconciled.status;
        if reconciled.clear_container {
            env.container_id = None;
            env.status_msg = Some("container no longer exists".to_string());
        }
        self.store.save(&mut env)?;
        Ok(env)
    }

    /// Environments matching `opts`, reconciled and ordered
    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<Environment>> {
        let stored = self.store.list()?;
        let synced = futures::future::join_all(stored.into_iter().map(|e| self.sync_status(e)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let mut envs: Vec<Environment> = synced
            .into_iter()
            .filter(|e| opts.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                opts.project
                    .as_deref()
                    .map_or(true, |p| same_path(&e.project_dir, p))
            })
            .filter(|e| opts.tag.as_ref().map_or(true, |t| e.tags.contains(t)))
            .collect();

        match opts.sort_by {
            SortBy::Name => envs.sort_by(|a, b| a.name.cmp(&b.name)),
            SortBy::Created => envs.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }
        if opts.desc {
            envs.reverse();
        }
        if let Some(limit) = opts.limit {
            envs.truncate(limit);
        }
        Ok(envs)
    }

    /// Make an environment the active one
    pub async fn switch(&self, name_or_id: &str) -> Result<Environment> {
        let env = self.get(name_or_id).await?;
        self.store.set_active(&env.id)?;
        self.store.update_last_used(&env.id)?;
        self.store.load(&env.id)
    }

    pub async fn get_active(&self) -> Result<Environment> {
        match self.store.get_active()? {
            Some(id) => self.get(&id).await,
            None => Err(
                CoreError::new(ErrorCode::EnvNotFound, "no active environment")
                    .with_suggestion("No active environment. Use 'cm env switch <name>' to set one"),
            ),
        }
    }

    /// Remove orphaned environments (and failed ones with `all`), then
    /// unused managed networks
    ///
    /// Returns how many environments were removed.
    pub async fn prune(&self, all: bool) -> Result<usize> {
        let envs = self.list(&ListOptions::default()).await?;
        let mut removed = 0;

        for env in envs {
            let prunable = env.status == EnvironmentStatus::Orphaned
                || (all && env.status == EnvironmentStatus::Error);
            if !prunable {
                continue;
            }

            self.teardown(&env, true).await?;
            self.store.delete(&env.id)?;
            self.forget_links(&env.id);
            removed += 1;
            debug!("Pruned environment {}", env.name);
        }

        if let Err(e) = self.networks.prune_networks().await {
            warn!("Failed to prune networks: {}", e);
        }
        Ok(removed)
    }

    /// Drop `id` from every other environment's links
    fn forget_links(&self, id: &str) {
        let envs = match self.store.list() {
            Ok(envs) => envs,
            Err(e) => {
                warn!("Cannot clean up links to {}: {}", id, e);
                return;
            }
        };
        for mut env in envs.into_iter().filter(|e| e.linked_envs.contains(id)) {
            env.linked_envs.remove(id);
            if let Err(e) = self.store.save(&mut env) {
                warn!("Cannot clean up link from {} to {}: {}", env.name, id, e);
            }
        }
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::path::absolute(a), std::path::absolute(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Absolute project directory, defaulting to the current directory
pub(crate) fn resolve_project_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    Ok(std::path::absolute(dir)?)
}

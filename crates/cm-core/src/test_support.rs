//! Test support utilities for cm-core
//!
//! Provides a MockProvider that behaves like a small in-memory container
//! engine (containers, images and networks with attachments), so the
//! environment and network managers can be tested without a real
//! Docker/Podman runtime.

use async_trait::async_trait;
use cm_config::{ConfigError, ConfigLoader, EnvironmentConfig};
use cm_provider::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Config loader returning a fixed configuration for every project
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    pub config: Option<EnvironmentConfig>,
}

impl StaticLoader {
    /// Every project runs `image`
    pub fn image(image: &str) -> Self {
        Self {
            config: Some(EnvironmentConfig::from_image(image)),
        }
    }

    pub fn with(config: EnvironmentConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// No project has a configuration
    pub fn missing() -> Self {
        Self { config: None }
    }
}

impl ConfigLoader for StaticLoader {
    fn load(
        &self,
        project_dir: &Path,
        template: Option<&str>,
    ) -> cm_config::Result<EnvironmentConfig> {
        match (&self.config, template) {
            (Some(config), _) => Ok(config.clone()),
            (None, Some(template)) => Ok(EnvironmentConfig::from_image(
                cm_config::template_image(template),
            )),
            (None, None) => Err(ConfigError::NotFound(project_dir.to_path_buf())),
        }
    }
}

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Build { tag: String },
    Pull { image: String },
    ImageExists { image: String },
    Create { image: String, name: Option<String> },
    Start { id: String },
    Stop { id: String, timeout: Option<u32> },
    Remove { id: String, force: bool },
    Exec { id: String, cmd: Vec<String> },
    Inspect { id: String },
    CreateNetwork { name: String },
    RemoveNetwork { network: String },
    InspectNetwork { network: String },
    ListNetworks,
    ConnectNetwork { network: String, container: String, aliases: Vec<String> },
    DisconnectNetwork { network: String, container: String },
    PruneNetworks,
    Ping,
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Build,
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Exec,
    Inspect,
    CreateNetwork,
    RemoveNetwork,
    ConnectNetwork,
    DisconnectNetwork,
    Ping,
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    image: String,
    status: ContainerStatus,
    labels: HashMap<String, String>,
    env: HashMap<String, String>,
    /// Network ID -> aliases
    networks: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct Engine {
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    networks: HashMap<String, NetworkInfo>,
    failures: HashMap<MockOp, ProviderError>,
    exec_result: Option<ExecResult>,
    created: HashMap<String, CreateContainerConfig>,
    next_id: u64,
}

impl Engine {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:060x}", prefix, self.next_id)
    }

    fn fail(&self, op: MockOp) -> Result<()> {
        match self.failures.get(&op) {
            Some(err) => Err(clone_provider_error(err)),
            None => Ok(()),
        }
    }

    fn container_key(&self, id_or_name: &str) -> Result<String> {
        self.containers
            .values()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .map(|c| c.id.clone())
            .ok_or_else(|| ProviderError::ContainerNotFound(id_or_name.to_string()))
    }

    fn network_key(&self, id_or_name: &str) -> Result<String> {
        self.networks
            .values()
            .find(|n| n.id == id_or_name || n.name == id_or_name)
            .map(|n| n.id.clone())
            .ok_or_else(|| ProviderError::NetworkNotFound(id_or_name.to_string()))
    }

    fn attach(&mut self, network_id: &str, container_id: &str, aliases: &[String]) -> Result<()> {
        let container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::ContainerNotFound(container_id.to_string()))?;
        let network = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| ProviderError::NetworkNotFound(network_id.to_string()))?;

        if container.networks.contains_key(network_id) {
            return Err(ProviderError::Conflict(format!(
                "endpoint with name {} already exists in network {}",
                container.name, network.name
            )));
        }
        container
            .networks
            .insert(network_id.to_string(), aliases.to_vec());
        network
            .containers
            .insert(container.id.clone(), container.name.clone());
        Ok(())
    }

    fn detach_everywhere(&mut self, container_id: &str) {
        for network in self.networks.values_mut() {
            network.containers.remove(container_id);
        }
    }
}

/// In-memory container engine for tests
pub struct MockProvider {
    pub provider_type: ProviderType,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    engine: Mutex<Engine>,
}

impl MockProvider {
    /// Create an empty engine
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            calls: Arc::new(Mutex::new(Vec::new())),
            engine: Mutex::new(Engine::default()),
        }
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn engine(&self) -> std::sync::MutexGuard<'_, Engine> {
        self.engine.lock().unwrap()
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Check if a specific call was made
    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Count calls matching a predicate
    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Make every following call of `op` fail with `err`
    pub fn fail_on(&self, op: MockOp, err: ProviderError) {
        self.engine().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.engine().failures.remove(&op);
    }

    /// Make an image available locally
    pub fn add_image(&self, image: &str) {
        self.engine().images.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.engine().images.contains(image)
    }

    /// Result returned by every exec
    pub fn set_exec_result(&self, exit_code: i64, output: &str) {
        self.engine().exec_result = Some(ExecResult {
            exit_code,
            output: output.to_string(),
        });
    }

    pub fn container_exists(&self, id_or_name: &str) -> bool {
        self.engine().container_key(id_or_name).is_ok()
    }

    pub fn container_count(&self) -> usize {
        self.engine().containers.len()
    }

    /// The create request a container was made from
    pub fn created_config(&self, id: &str) -> Option<CreateContainerConfig> {
        self.engine().created.get(id).cloned()
    }

    /// Change a container's state behind the manager's back
    pub fn set_container_status(&self, id: &str, status: ContainerStatus) {
        if let Some(c) = self.engine().containers.get_mut(id) {
            c.status = status;
        }
    }

    /// Remove a container behind the manager's back
    pub fn remove_container_externally(&self, id: &str) {
        let mut engine = self.engine();
        engine.containers.remove(id);
        engine.detach_everywhere(id);
    }

    pub fn network(&self, id_or_name: &str) -> Option<NetworkInfo> {
        let engine = self.engine();
        let key = engine.network_key(id_or_name).ok()?;
        engine.networks.get(&key).cloned()
    }

    pub fn network_count(&self) -> usize {
        self.engine().networks.len()
    }

    /// Create a network directly, bypassing the call log
    pub fn add_network(&self, name: &str, labels: HashMap<String, String>) -> String {
        let mut engine = self.engine();
        let id = engine.next_id("n");
        engine.networks.insert(
            id.clone(),
            NetworkInfo {
                id: id.clone(),
                name: name.to_string(),
                driver: "bridge".to_string(),
                scope: "local".to_string(),
                labels,
                created_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        );
        id
    }

    /// Run a bare container attached to `network`, bypassing the call log
    pub fn add_running_container(&self, name: &str, network: Option<&str>) -> String {
        let mut engine = self.engine();
        let id = engine.next_id("c");
        engine.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: "alpine:latest".to_string(),
                status: ContainerStatus::Running,
                labels: HashMap::new(),
                env: HashMap::new(),
                networks: HashMap::new(),
            },
        );
        if let Some(network) = network {
            if let Ok(net_id) = engine.network_key(network) {
                let _ = engine.attach(&net_id, &id, &[]);
            }
        }
        id
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(ProviderType::Docker)
    }
}

/// Clone a ProviderError (thiserror types don't implement Clone)
fn clone_provider_error(e: &ProviderError) -> ProviderError {
    match e {
        ProviderError::ConnectionError(s) => ProviderError::ConnectionError(s.clone()),
        ProviderError::ContainerNotFound(s) => ProviderError::ContainerNotFound(s.clone()),
        ProviderError::ImageNotFound(s) => ProviderError::ImageNotFound(s.clone()),
        ProviderError::NetworkNotFound(s) => ProviderError::NetworkNotFound(s.clone()),
        ProviderError::Conflict(s) => ProviderError::Conflict(s.clone()),
        ProviderError::BuildError(s) => ProviderError::BuildError(s.clone()),
        ProviderError::ExecError(s) => ProviderError::ExecError(s.clone()),
        ProviderError::RuntimeError(s) => ProviderError::RuntimeError(s.clone()),
        ProviderError::ConfigError(s) => ProviderError::ConfigError(s.clone()),
        ProviderError::IoError(_) => ProviderError::RuntimeError("IO error (cloned)".into()),
    }
}

fn matches_labels(labels: &HashMap<String, String>, wanted: &HashMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ContainerProvider for MockProvider {
    async fn build(&self, config: &BuildConfig) -> Result<ImageId> {
        self.record(MockCall::Build {
            tag: config.tag.clone(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::Build)?;
        engine.images.insert(config.tag.clone());
        Ok(ImageId::new(format!("sha256:{}", config.tag)))
    }

    async fn pull(&self, image: &str) -> Result<ImageId> {
        self.record(MockCall::Pull {
            image: image.to_string(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::Pull)?;
        engine.images.insert(image.to_string());
        Ok(ImageId::new(format!("sha256:{}", image)))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(MockCall::ImageExists {
            image: image.to_string(),
        });
        Ok(self.engine().images.contains(image))
    }

    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId> {
        self.record(MockCall::Create {
            image: config.image.clone(),
            name: config.name.clone(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::Create)?;

        if !engine.images.contains(&config.image) {
            return Err(ProviderError::ImageNotFound(config.image.clone()));
        }
        if let Some(ref name) = config.name {
            if engine.containers.values().any(|c| &c.name == name) {
                return Err(ProviderError::Conflict(format!(
                    "container name {} is already in use",
                    name
                )));
            }
        }
        let network = match config.network_mode.as_deref() {
            Some(mode) if !matches!(mode, "bridge" | "host" | "none" | "default") => {
                Some(engine.network_key(mode)?)
            }
            _ => None,
        };

        let id = engine.next_id("c");
        engine.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: config.name.clone().unwrap_or_else(|| id.clone()),
                image: config.image.clone(),
                status: ContainerStatus::Created,
                labels: config.labels.clone(),
                env: config.env.clone(),
                networks: HashMap::new(),
            },
        );
        engine.created.insert(id.clone(), config.clone());
        if let Some(network) = network {
            engine.attach(&network, &id, &config.network_aliases)?;
        }
        Ok(ContainerId::new(id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Start { id: id.0.clone() });
        let mut engine = self.engine();
        engine.fail(MockOp::Start)?;
        let key = engine.container_key(&id.0)?;
        if let Some(c) = engine.containers.get_mut(&key) {
            c.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, timeout: Option<u32>) -> Result<()> {
        self.record(MockCall::Stop {
            id: id.0.clone(),
            timeout,
        });
        let mut engine = self.engine();
        engine.fail(MockOp::Stop)?;
        let key = engine.container_key(&id.0)?;
        if let Some(c) = engine.containers.get_mut(&key) {
            c.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        self.record(MockCall::Remove {
            id: id.0.clone(),
            force,
        });
        let mut engine = self.engine();
        engine.fail(MockOp::Remove)?;
        let key = engine.container_key(&id.0)?;
        let running = engine
            .containers
            .get(&key)
            .is_some_and(|c| c.status == ContainerStatus::Running);
        if running && !force {
            return Err(ProviderError::Conflict(format!(
                "cannot remove running container {}",
                id.short()
            )));
        }
        engine.containers.remove(&key);
        engine.detach_everywhere(&key);
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, config: &ExecConfig) -> Result<ExecResult> {
        self.record(MockCall::Exec {
            id: id.0.clone(),
            cmd: config.cmd.clone(),
        });
        let engine = self.engine();
        engine.fail(MockOp::Exec)?;
        let key = engine.container_key(&id.0)?;
        if engine
            .containers
            .get(&key)
            .is_some_and(|c| c.status != ContainerStatus::Running)
        {
            return Err(ProviderError::Conflict(format!(
                "container {} is not running",
                id.short()
            )));
        }
        Ok(engine.exec_result.clone().unwrap_or(ExecResult {
            exit_code: 0,
            output: String::new(),
        }))
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails> {
        self.record(MockCall::Inspect { id: id.0.clone() });
        let engine = self.engine();
        engine.fail(MockOp::Inspect)?;
        let key = engine.container_key(&id.0)?;
        let c = &engine.containers[&key];

        let networks = c
            .networks
            .iter()
            .filter_map(|(net_id, aliases)| {
                let net = engine.networks.get(net_id)?;
                Some((
                    net.name.clone(),
                    EndpointInfo {
                        network_id: net_id.clone(),
                        ip_address: None,
                        aliases: aliases.clone(),
                    },
                ))
            })
            .collect();

        Ok(ContainerDetails {
            id: ContainerId::new(c.id.clone()),
            name: c.name.clone(),
            image: c.image.clone(),
            status: c.status,
            created: 0,
            started_at: None,
            exit_code: None,
            labels: c.labels.clone(),
            ports: Vec::new(),
            networks,
        })
    }

    async fn create_network(&self, config: &CreateNetworkConfig) -> Result<String> {
        self.record(MockCall::CreateNetwork {
            name: config.name.clone(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::CreateNetwork)?;
        if engine.networks.values().any(|n| n.name == config.name) {
            return Err(ProviderError::Conflict(format!(
                "network with name {} already exists",
                config.name
            )));
        }
        let id = engine.next_id("n");
        engine.networks.insert(
            id.clone(),
            NetworkInfo {
                id: id.clone(),
                name: config.name.clone(),
                driver: config.driver.clone().unwrap_or_else(|| "bridge".into()),
                scope: "local".to_string(),
                internal: config.internal,
                containers: HashMap::new(),
                labels: config.labels.clone(),
                created_at: Some(chrono::Utc::now()),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, id_or_name: &str) -> Result<()> {
        self.record(MockCall::RemoveNetwork {
            network: id_or_name.to_string(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::RemoveNetwork)?;
        let key = engine.network_key(id_or_name)?;
        if !engine.networks[&key].containers.is_empty() {
            return Err(ProviderError::Conflict(format!(
                "network {} has active endpoints",
                id_or_name
            )));
        }
        engine.networks.remove(&key);
        Ok(())
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo> {
        self.record(MockCall::InspectNetwork {
            network: id_or_name.to_string(),
        });
        let engine = self.engine();
        let key = engine.network_key(id_or_name)?;
        Ok(engine.networks[&key].clone())
    }

    async fn list_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<NetworkInfo>> {
        self.record(MockCall::ListNetworks);
        let engine = self.engine();
        let mut networks: Vec<NetworkInfo> = engine
            .networks
            .values()
            .filter(|n| matches_labels(&n.labels, labels))
            .cloned()
            .collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &ContainerId,
        aliases: &[String],
    ) -> Result<()> {
        self.record(MockCall::ConnectNetwork {
            network: network.to_string(),
            container: container.0.clone(),
            aliases: aliases.to_vec(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::ConnectNetwork)?;
        let net_id = engine.network_key(network)?;
        let container_id = engine.container_key(&container.0)?;
        engine.attach(&net_id, &container_id, aliases)
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        _force: bool,
    ) -> Result<()> {
        self.record(MockCall::DisconnectNetwork {
            network: network.to_string(),
            container: container.0.clone(),
        });
        let mut engine = self.engine();
        engine.fail(MockOp::DisconnectNetwork)?;
        let net_id = engine.network_key(network)?;
        let container_id = engine.container_key(&container.0)?;

        let attached = engine
            .containers
            .get_mut(&container_id)
            .and_then(|c| c.networks.remove(&net_id))
            .is_some();
        if !attached {
            return Err(ProviderError::RuntimeError(format!(
                "container {} is not connected to network {}",
                container.short(),
                network
            )));
        }
        if let Some(n) = engine.networks.get_mut(&net_id) {
            n.containers.remove(&container_id);
        }
        Ok(())
    }

    async fn prune_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<String>> {
        self.record(MockCall::PruneNetworks);
        let mut engine = self.engine();
        let unused: Vec<String> = engine
            .networks
            .values()
            .filter(|n| n.containers.is_empty() && matches_labels(&n.labels, labels))
            .map(|n| n.id.clone())
            .collect();

        let mut names = Vec::new();
        for id in unused {
            if let Some(n) = engine.networks.remove(&id) {
                names.push(n.name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> Result<()> {
        self.record(MockCall::Ping);
        self.engine().fail(MockOp::Ping)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider_type: self.provider_type,
            version: "mock-1.0".to_string(),
            api_version: "mock".to_string(),
            os: "test".to_string(),
            arch: "test".to_string(),
        }
    }
}

impl MockProvider {
    /// Environment variables a container was created with
    pub fn container_env(&self, id: &str) -> Option<HashMap<String, String>> {
        self.engine().containers.get(id).map(|c| c.env.clone())
    }

    /// Names of the networks a container is attached to
    pub fn container_networks(&self, id: &str) -> Vec<String> {
        let engine = self.engine();
        let mut names: Vec<String> = engine
            .containers
            .get(id)
            .map(|c| {
                c.networks
                    .keys()
                    .filter_map(|net| engine.networks.get(net).map(|n| n.name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

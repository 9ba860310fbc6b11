//! Per-environment networks and explicit linking between environments
//!
//! Every environment gets its own bridge network named `cm-<name>`. Linking
//! two environments attaches each one's container to the other's network,
//! with the environment name as DNS alias. Networks are recognised as ours
//! by the managed-by label only, never by their name.

use crate::{CoreError, Environment, ErrorCode, Result};
use cm_provider::{ContainerId, ContainerProvider, CreateNetworkConfig, NetworkInfo, ProviderError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of every environment network and container name
pub const NETWORK_PREFIX: &str = "cm-";

pub const NETWORK_DRIVER: &str = "bridge";

pub const LABEL_MANAGED_BY: &str = "cm.managed_by";
pub const MANAGED_BY: &str = "container-maker";
pub const LABEL_ENV_ID: &str = "cm.environment_id";
pub const LABEL_ENV_NAME: &str = "cm.environment_name";
pub const LABEL_PROJECT: &str = "cm.project";
pub const LABEL_CREATED_AT: &str = "cm.created_at";

fn managed_labels() -> HashMap<String, String> {
    HashMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string())])
}

/// Whether a network carries the managed-by label
pub fn is_managed_network(info: &NetworkInfo) -> bool {
    info.labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY)
}

/// `name` with the network prefix, added when missing
pub fn network_name(name: &str) -> String {
    if name.starts_with(NETWORK_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", NETWORK_PREFIX, name)
    }
}

/// Creates, links and removes environment networks
pub struct NetworkManager {
    provider: Arc<dyn ContainerProvider>,
}

impl NetworkManager {
    pub fn new(provider: Arc<dyn ContainerProvider>) -> Self {
        Self { provider }
    }

    /// Create a managed network, or return the ID of the one already
    /// holding the (prefixed) name
    pub async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(CoreError::invalid_name(name, "network name cannot be empty"));
        }
        let name = network_name(name);

        match self.provider.inspect_network(&name).await {
            Ok(existing) => {
                debug!("Network {} already exists ({})", name, existing.id);
                return Ok(existing.id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut all_labels = managed_labels();
        all_labels.insert(LABEL_CREATED_AT.to_string(), chrono::Utc::now().to_rfc3339());
        all_labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let config = CreateNetworkConfig {
            name: name.clone(),
            driver: Some(NETWORK_DRIVER.to_string()),
            internal: false,
            attachable: true,
            labels: all_labels,
            options: HashMap::from([
                (
                    "com.docker.network.bridge.enable_ip_masquerade".to_string(),
                    "true".to_string(),
                ),
                (
                    "com.docker.network.bridge.enable_icc".to_string(),
                    "true".to_string(),
                ),
            ]),
        };

        match self.provider.create_network(&config).await {
            Ok(id) => {
                debug!("Created network {} ({})", name, id);
                Ok(id)
            }
            // Someone else created it between our inspect and create
            Err(e) if e.is_conflict() => {
                debug!("Network {} appeared concurrently", name);
                Ok(self.get_network(&name).await?.id)
            }
            Err(e) => Err(CoreError::from(e)
                .with_suggestion("Check that the container runtime may create networks")),
        }
    }

    /// Remove a network that has no attached containers
    pub async fn delete_network(&self, id_or_name: &str) -> Result<()> {
        let info = self.get_network(id_or_name).await?;

        if !info.containers.is_empty() {
            let mut names: Vec<&str> = info.containers.values().map(String::as_str).collect();
            names.sort_unstable();
            return Err(CoreError::new(
                ErrorCode::NetworkInUse,
                format!("network {} is still in use", info.name),
            )
            .with_suggestion(format!(
                "Disconnect these containers first: {}",
                names.join(", ")
            )));
        }

        self.provider.remove_network(&info.id).await?;
        debug!("Removed network {}", info.name);
        Ok(())
    }

    /// Disconnect every attached container, then remove the network
    pub async fn force_delete_network(&self, id_or_name: &str) -> Result<()> {
        let info = self.get_network(id_or_name).await?;

        for (container_id, container_name) in &info.containers {
            let id = ContainerId::new(container_id.as_str());
            if let Err(e) = self.provider.disconnect_network(&info.id, &id, true).await {
                warn!(
                    "Failed to disconnect {} from network {}: {}",
                    container_name, info.name, e
                );
            }
        }

        self.delete_network(&info.id).await
    }

    pub async fn connect_to_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<()> {
        self.provider
            .connect_network(network, &ContainerId::new(container_id), aliases)
            .await?;
        Ok(())
    }

    pub async fn disconnect_from_network(&self, network: &str, container_id: &str) -> Result<()> {
        self.provider
            .disconnect_network(network, &ContainerId::new(container_id), false)
            .await?;
        Ok(())
    }

    pub async fn get_network(&self, id_or_name: &str) -> Result<NetworkInfo> {
        self.provider
            .inspect_network(id_or_name)
            .await
            .map_err(|e| match e {
                ProviderError::NetworkNotFound(_) => {
                    CoreError::network_not_found(id_or_name).with_source(e)
                }
                e => e.into(),
            })
    }

    /// Managed networks carrying all of `labels`
    pub async fn list_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<NetworkInfo>> {
        let mut filter = managed_labels();
        filter.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(self.provider.list_networks(&filter).await?)
    }

    /// Every network the runtime knows, ours or not
    pub async fn list_all_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.provider.list_networks(&HashMap::new()).await?)
    }

    /// Remove managed networks without attached containers
    pub async fn prune_networks(&self) -> Result<Vec<String>> {
        let pruned = self.provider.prune_networks(&managed_labels()).await?;
        if !pruned.is_empty() {
            debug!("Pruned networks: {}", pruned.join(", "));
        }
        Ok(pruned)
    }

    pub async fn get_network_for_environment(&self, env_id: &str) -> Result<NetworkInfo> {
        let labels = HashMap::from([(LABEL_ENV_ID.to_string(), env_id.to_string())]);
        self.list_networks(&labels)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoreError::new(ErrorCode::NetworkNotFound, "environment has no network")
                    .with_env(env_id, "")
            })
    }

    /// Create the `cm-<name>` network of an environment, returning its ID
    pub async fn create_environment_network(&self, env: &Environment) -> Result<String> {
        let mut labels = HashMap::from([
            (LABEL_ENV_ID.to_string(), env.id.clone()),
            (LABEL_ENV_NAME.to_string(), env.name.clone()),
        ]);
        if !env.project_dir.as_os_str().is_empty() {
            labels.insert(
                LABEL_PROJECT.to_string(),
                env.project_dir.display().to_string(),
            );
        }

        self.create_network(&env.name, &labels).await
    }

    /// The environment's network ID, creating the network when the record
    /// has none or it has disappeared
    ///
    /// Updates the network fields of `env`; callers persist the record.
    pub async fn ensure_environment_network(&self, env: &mut Environment) -> Result<String> {
        if let Some(ref id) = env.network_id {
            match self.get_network(id).await {
                Ok(info) => return Ok(info.id),
                Err(e) if e.is(ErrorCode::NetworkNotFound) => {
                    debug!("Network of {} is gone, recreating", env.name);
                }
                Err(e) => return Err(e),
            }
        }

        let id = self.create_environment_network(env).await?;
        env.network_id = Some(id.clone());
        env.network_name = Some(network_name(&env.name));
        Ok(id)
    }

    /// Attach each environment's container to the other's network
    ///
    /// Both environments get a network if they lack one. Containers that
    /// are already attached are left alone.
    pub async fn link_environments(
        &self,
        env1: &mut Environment,
        env2: &mut Environment,
    ) -> Result<()> {
        let network1 = self.ensure_environment_network(env1).await?;
        let network2 = self.ensure_environment_network(env2).await?;

        if let Some(ref container) = env1.container_id {
            self.connect_idempotent(&network2, container, &env1.name)
                .await?;
        }
        if let Some(ref container) = env2.container_id {
            self.connect_idempotent(&network1, container, &env2.name)
                .await?;
        }
        Ok(())
    }

    /// Attach every linked environment's network to `env`'s container
    ///
    /// Used when a container is provisioned after its links were made.
    pub async fn attach_links(&self, env: &Environment, linked: &[Environment]) -> Result<()> {
        let Some(ref container) = env.container_id else {
            return Ok(());
        };
        for other in linked {
            if let Some(ref network) = other.network_id {
                self.connect_idempotent(network, container, &env.name).await?;
            }
        }
        Ok(())
    }

    async fn connect_idempotent(&self, network: &str, container: &str, alias: &str) -> Result<()> {
        let aliases = [alias.to_string()];
        match self
            .provider
            .connect_network(network, &ContainerId::new(container), &aliases)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!("{} already attached to {}", alias, network);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Detach each environment's container from the other's network
    ///
    /// Failures are ignored; the network or container may already be gone.
    pub async fn unlink_environments(&self, env1: &Environment, env2: &Environment) {
        let network_of = |env: &Environment| {
            env.network_id
                .clone()
                .unwrap_or_else(|| network_name(&env.name))
        };

        if let Some(ref container) = env1.container_id {
            if let Err(e) = self
                .disconnect_from_network(&network_of(env2), container)
                .await
            {
                debug!("Ignoring disconnect of {}: {}", env1.name, e);
            }
        }
        if let Some(ref container) = env2.container_id {
            if let Err(e) = self
                .disconnect_from_network(&network_of(env1), container)
                .await
            {
                debug!("Ignoring disconnect of {}: {}", env2.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCall, MockOp, MockProvider};

    fn setup() -> (Arc<MockProvider>, NetworkManager) {
        let mock = Arc::new(MockProvider::default());
        let manager = NetworkManager::new(mock.clone());
        (mock, manager)
    }

    fn env_with_container(mock: &MockProvider, name: &str) -> Environment {
        let mut env = Environment::new(name, "/src/project");
        env.container_id = Some(mock.add_running_container(&format!("cm-{}", name), None));
        env
    }

    #[test]
    fn test_network_name_prefix() {
        assert_eq!(network_name("web"), "cm-web");
        assert_eq!(network_name("cm-web"), "cm-web");
    }

    #[test]
    fn test_is_managed_network_requires_label_value() {
        let mut info = NetworkInfo {
            name: "cm-web".into(),
            ..Default::default()
        };
        assert!(!is_managed_network(&info));

        info.labels.insert(LABEL_MANAGED_BY.into(), "someone-else".into());
        assert!(!is_managed_network(&info));

        info.labels.insert(LABEL_MANAGED_BY.into(), MANAGED_BY.into());
        assert!(is_managed_network(&info));
    }

    #[tokio::test]
    async fn test_create_network_is_idempotent() {
        let (mock, nm) = setup();

        let first = nm.create_network("x", &HashMap::new()).await.unwrap();
        let second = nm.create_network("x", &HashMap::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.network_count(), 1);
        assert_eq!(
            mock.count_calls(|c| matches!(c, MockCall::CreateNetwork { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_create_network_labels_and_options() {
        let (mock, nm) = setup();
        let labels = HashMap::from([("team".to_string(), "infra".to_string())]);

        nm.create_network("web", &labels).await.unwrap();

        let info = mock.network("cm-web").unwrap();
        assert!(is_managed_network(&info));
        assert_eq!(info.labels.get("team").map(String::as_str), Some("infra"));
        assert!(info.labels.contains_key(LABEL_CREATED_AT));
        assert_eq!(info.driver, "bridge");
    }

    #[tokio::test]
    async fn test_create_network_rejects_empty_name() {
        let (mock, nm) = setup();
        let err = nm.create_network("", &HashMap::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidName));
        assert!(mock.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_network_runtime_failure() {
        let (mock, nm) = setup();
        mock.fail_on(
            MockOp::CreateNetwork,
            ProviderError::RuntimeError("permission denied".into()),
        );

        let err = nm.create_network("web", &HashMap::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::RuntimeError));
        assert!(err.suggestion.is_some());
    }

    #[tokio::test]
    async fn test_delete_network_in_use_lists_containers() {
        let (mock, nm) = setup();
        nm.create_network("web", &HashMap::new()).await.unwrap();
        mock.add_running_container("cm-api", Some("cm-web"));

        let err = nm.delete_network("cm-web").await.unwrap_err();
        assert!(err.is(ErrorCode::NetworkInUse));
        assert!(err.suggestion.unwrap().contains("cm-api"));
        assert!(mock.network("cm-web").is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_network() {
        let (_mock, nm) = setup();
        let err = nm.delete_network("cm-ghost").await.unwrap_err();
        assert!(err.is(ErrorCode::NetworkNotFound));
    }

    #[tokio::test]
    async fn test_force_delete_network_disconnects_everything() {
        let (mock, nm) = setup();
        nm.create_network("web", &HashMap::new()).await.unwrap();
        let a = mock.add_running_container("cm-a", Some("cm-web"));
        let b = mock.add_running_container("cm-b", Some("cm-web"));

        nm.force_delete_network("cm-web").await.unwrap();

        assert!(mock.network("cm-web").is_none());
        assert!(mock.container_networks(&a).is_empty());
        assert!(mock.container_networks(&b).is_empty());
    }

    #[tokio::test]
    async fn test_force_delete_network_reports_stuck_containers() {
        let (mock, nm) = setup();
        nm.create_network("web", &HashMap::new()).await.unwrap();
        mock.add_running_container("cm-a", Some("cm-web"));
        mock.fail_on(
            MockOp::DisconnectNetwork,
            ProviderError::RuntimeError("busy".into()),
        );

        let err = nm.force_delete_network("cm-web").await.unwrap_err();
        assert!(err.is(ErrorCode::NetworkInUse));
    }

    #[tokio::test]
    async fn test_get_network_for_environment() {
        let (_mock, nm) = setup();
        let env = Environment::new("web", "/src/web");
        let id = nm.create_environment_network(&env).await.unwrap();

        let info = nm.get_network_for_environment(&env.id).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.name, "cm-web");
        assert_eq!(
            info.labels.get(LABEL_PROJECT).map(String::as_str),
            Some("/src/web")
        );

        let err = nm.get_network_for_environment("env-missing").await.unwrap_err();
        assert!(err.is(ErrorCode::NetworkNotFound));
    }

    #[tokio::test]
    async fn test_list_networks_only_managed() {
        let (mock, nm) = setup();
        nm.create_network("web", &HashMap::new()).await.unwrap();
        mock.add_network("bridge", HashMap::new());

        let managed = nm.list_networks(&HashMap::new()).await.unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].name, "cm-web");

        let all = nm.list_all_networks().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_foreign_and_used_networks() {
        let (mock, nm) = setup();
        nm.create_network("idle", &HashMap::new()).await.unwrap();
        nm.create_network("busy", &HashMap::new()).await.unwrap();
        mock.add_running_container("cm-busy", Some("cm-busy"));
        mock.add_network("other", HashMap::new());

        let pruned = nm.prune_networks().await.unwrap();
        assert_eq!(pruned, vec!["cm-idle".to_string()]);
        assert!(mock.network("cm-busy").is_some());
        assert!(mock.network("other").is_some());
    }

    #[tokio::test]
    async fn test_link_environments_cross_connects() {
        let (mock, nm) = setup();
        let mut web = env_with_container(&mock, "web");
        let mut api = env_with_container(&mock, "api");

        nm.link_environments(&mut web, &mut api).await.unwrap();

        assert_eq!(web.network_name.as_deref(), Some("cm-web"));
        assert_eq!(api.network_name.as_deref(), Some("cm-api"));
        let web_container = web.container_id.clone().unwrap();
        let api_container = api.container_id.clone().unwrap();
        assert_eq!(mock.container_networks(&web_container), vec!["cm-api"]);
        assert_eq!(mock.container_networks(&api_container), vec!["cm-web"]);
        assert!(mock.was_called(&MockCall::ConnectNetwork {
            network: api.network_id.clone().unwrap(),
            container: web_container,
            aliases: vec!["web".to_string()],
        }));

        // Linking again is a no-op
        nm.link_environments(&mut web, &mut api).await.unwrap();
        assert_eq!(mock.network_count(), 2);
    }

    #[tokio::test]
    async fn test_link_recreates_vanished_network() {
        let (mock, nm) = setup();
        let mut web = env_with_container(&mock, "web");
        let mut api = Environment::new("api", "/src/api");
        web.network_id = Some("gone".into());

        nm.link_environments(&mut web, &mut api).await.unwrap();

        assert_ne!(web.network_id.as_deref(), Some("gone"));
        assert!(mock.network("cm-web").is_some());
        assert!(mock.network("cm-api").is_some());
    }

    #[tokio::test]
    async fn test_unlink_is_best_effort() {
        let (mock, nm) = setup();
        let mut web = env_with_container(&mock, "web");
        let mut api = env_with_container(&mock, "api");
        nm.link_environments(&mut web, &mut api).await.unwrap();

        nm.unlink_environments(&web, &api).await;
        assert!(mock
            .container_networks(web.container_id.as_deref().unwrap())
            .is_empty());

        // A second unlink finds nothing attached and still returns
        nm.unlink_environments(&web, &api).await;
    }

    #[tokio::test]
    async fn test_attach_links_connects_late_container() {
        let (mock, nm) = setup();
        let mut web = Environment::new("web", "/src/web");
        let mut api = env_with_container(&mock, "api");
        nm.link_environments(&mut web, &mut api).await.unwrap();

        web.container_id = Some(mock.add_running_container("cm-web", None));
        nm.attach_links(&web, std::slice::from_ref(&api))
            .await
            .unwrap();

        assert_eq!(
            mock.container_networks(web.container_id.as_deref().unwrap()),
            vec!["cm-api"]
        );
    }
}

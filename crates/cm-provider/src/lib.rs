//! Container provider trait and implementations for cm
//!
//! This crate provides an abstraction over container runtimes (Docker, Podman)
//! covering the container, image and network operations environments need.

mod docker;
mod error;
mod types;

pub use docker::DockerProvider;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use std::collections::HashMap;

/// Trait for container providers (Docker, Podman, etc.)
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Build an image from a Dockerfile
    async fn build(&self, config: &BuildConfig) -> Result<ImageId>;

    /// Pull an image from a registry
    async fn pull(&self, image: &str) -> Result<ImageId>;

    /// Whether an image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create a container from an image
    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId>;

    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a container, waiting `timeout` seconds before killing it
    async fn stop(&self, id: &ContainerId, timeout: Option<u32>) -> Result<()>;

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Execute a command in a running container and collect its output
    async fn exec(&self, id: &ContainerId, config: &ExecConfig) -> Result<ExecResult>;

    /// Get detailed information about a container
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails>;

    /// Create a network, returning its ID
    async fn create_network(&self, config: &CreateNetworkConfig) -> Result<String>;

    async fn remove_network(&self, id_or_name: &str) -> Result<()>;

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo>;

    /// List networks carrying all of `labels` (every network when empty)
    async fn list_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<NetworkInfo>>;

    /// Attach a container to a network with optional DNS aliases
    async fn connect_network(
        &self,
        network: &str,
        container: &ContainerId,
        aliases: &[String],
    ) -> Result<()>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        force: bool,
    ) -> Result<()>;

    /// Remove unused networks carrying all of `labels`, returning their names
    async fn prune_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<String>>;

    /// Check if the provider is available/connected
    async fn ping(&self) -> Result<()>;

    fn info(&self) -> ProviderInfo;
}

/// Factory function to create a provider based on type
pub async fn create_provider(
    provider_type: ProviderType,
    config: &cm_config::GlobalConfig,
) -> Result<Box<dyn ContainerProvider>> {
    match provider_type {
        ProviderType::Docker => {
            let socket = &config.providers.docker.socket;
            let provider = DockerProvider::new(socket).await?;
            Ok(Box::new(provider))
        }
        ProviderType::Podman => {
            // Podman serves the Docker-compatible API
            let socket = &config.providers.podman.socket;
            let provider = DockerProvider::new_podman(socket).await?;
            Ok(Box::new(provider))
        }
    }
}

/// Detect which providers respond, Docker first
pub async fn detect_available_providers(
    config: &cm_config::GlobalConfig,
) -> Vec<(ProviderType, bool)> {
    let (docker, podman) = tokio::join!(
        create_provider(ProviderType::Docker, config),
        create_provider(ProviderType::Podman, config)
    );

    vec![
        (ProviderType::Docker, docker.is_ok()),
        (ProviderType::Podman, podman.is_ok()),
    ]
}

/// Create the provider named by `requested`, the global config, or
/// auto-detection, in that order
pub async fn create_default_provider(
    config: &cm_config::GlobalConfig,
    requested: Option<ProviderType>,
) -> Result<Box<dyn ContainerProvider>> {
    let provider_type = match requested {
        Some(provider_type) => provider_type,
        None => match config.defaults.provider.as_str() {
            "podman" => ProviderType::Podman,
            "docker" => ProviderType::Docker,
            "" => {
                tracing::debug!("No provider configured, auto-detecting...");
                let available = detect_available_providers(config).await;
                match available.iter().find(|(_, available)| *available) {
                    Some((provider_type, _)) => {
                        tracing::debug!("Auto-detected provider: {}", provider_type);
                        *provider_type
                    }
                    None => {
                        tracing::warn!("No providers detected, defaulting to Docker");
                        ProviderType::Docker
                    }
                }
            }
            other => {
                tracing::warn!("Unknown provider {:?} in config, using Docker", other);
                ProviderType::Docker
            }
        },
    };

    let socket_path = match provider_type {
        ProviderType::Podman => &config.providers.podman.socket,
        ProviderType::Docker => &config.providers.docker.socket,
    };

    create_provider(provider_type, config).await.map_err(|e| {
        let socket_exists = std::path::Path::new(socket_path).exists();
        ProviderError::ConnectionError(format_connection_error(
            provider_type,
            socket_path,
            socket_exists,
            &e,
        ))
    })
}

/// Format a connection failure with actionable instructions
fn format_connection_error(
    provider: ProviderType,
    socket_path: &str,
    socket_exists: bool,
    underlying: &ProviderError,
) -> String {
    let provider_name = match provider {
        ProviderType::Podman => "Podman",
        ProviderType::Docker => "Docker",
    };

    let mut msg = format!("Cannot connect to {}\n\n", provider_name);

    if !socket_exists {
        msg.push_str(&format!(
            "The {} API socket was not found at:\n  {}\n\n",
            provider_name, socket_path
        ));

        match provider {
            ProviderType::Podman => {
                msg.push_str("To enable the Podman socket, run:\n");
                msg.push_str("  systemctl --user enable --now podman.socket\n");
            }
            ProviderType::Docker => {
                msg.push_str("To start Docker, run:\n");
                msg.push_str("  sudo systemctl enable --now docker\n");
            }
        }
    } else {
        msg.push_str(&format!(
            "The socket exists at {} but the daemon is not responding.\n\n",
            socket_path
        ));
        msg.push_str(&format!("Underlying error: {}\n", underlying));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_missing_socket() {
        let msg = format_connection_error(
            ProviderType::Podman,
            "/run/user/1000/podman/podman.sock",
            false,
            &ProviderError::ConnectionError("refused".into()),
        );
        assert!(msg.contains("Cannot connect to Podman"));
        assert!(msg.contains("podman.socket"));
        assert!(!msg.contains("refused"));
    }

    #[test]
    fn test_connection_error_daemon_down() {
        let msg = format_connection_error(
            ProviderType::Docker,
            "/var/run/docker.sock",
            true,
            &ProviderError::ConnectionError("refused".into()),
        );
        assert!(msg.contains("not responding"));
        assert!(msg.contains("refused"));
    }
}

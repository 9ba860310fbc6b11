//! Docker provider implementation using bollard

use crate::error::{image_err, network_err};
use crate::{
    BuildConfig, ContainerDetails, ContainerId, ContainerProvider, ContainerStatus,
    CreateContainerConfig, CreateNetworkConfig, EndpointInfo, ExecConfig, ExecResult, GpuRequest,
    ImageId, MountType, NetworkInfo, PortInfo, ProviderError, ProviderInfo, ProviderType,
    ResourceLimits, Result,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions, PruneNetworksOptions,
};
use bollard::service::{DeviceRequest, EndpointSettings, HostConfig, Mount, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

/// Docker provider using bollard crate
pub struct DockerProvider {
    client: Docker,
    provider_type: ProviderType,
}

impl DockerProvider {
    /// Connect to a Docker-compatible socket and ping it
    pub async fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
        } else {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        client
            .ping()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            provider_type: ProviderType::Docker,
        })
    }

    /// Connect to Podman's Docker-compatible API
    pub async fn new_podman(socket_path: &str) -> Result<Self> {
        let mut provider = Self::new(socket_path).await?;
        provider.provider_type = ProviderType::Podman;
        Ok(provider)
    }
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    async fn build(&self, config: &BuildConfig) -> Result<ImageId> {
        let tar_data = create_build_context(&config.context)?;

        let options = BuildImageOptions {
            dockerfile: config.dockerfile.clone(),
            t: config.tag.clone(),
            buildargs: config.build_args.clone(),
            nocache: config.no_cache,
            pull: config.pull,
            rm: true,
            labels: config.labels.clone(),
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(tar_data.into()));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(ProviderError::BuildError(error));
                    }
                    if let Some(id) = output.aux.and_then(|aux| aux.id) {
                        image_id = Some(id);
                    }
                    if let Some(stream) = output.stream {
                        tracing::debug!("{}", stream.trim());
                    }
                }
                Err(e) => return Err(ProviderError::BuildError(e.to_string())),
            }
        }

        image_id
            .map(ImageId::new)
            .ok_or_else(|| ProviderError::BuildError("No image ID returned".to_string()))
    }

    async fn pull(&self, image: &str) -> Result<ImageId> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(ProviderError::ImageNotFound(error));
                    }
                    if let Some(status) = info.status {
                        tracing::debug!("{}", status);
                    }
                }
                Err(e) => return Err(image_err(e, image)),
            }
        }

        let inspect = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| image_err(e, image))?;

        Ok(ImageId::new(inspect.id.unwrap_or_else(|| image.to_string())))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match image_err(e, image) {
                ProviderError::ImageNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId> {
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        });

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = PortBinding {
                host_ip: port.host_ip.clone(),
                host_port: port.host_port.map(|p| p.to_string()),
            };
            port_bindings.insert(container_port, Some(vec![binding]));
        }

        let mounts: Vec<Mount> = config
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(match m.mount_type {
                    MountType::Bind => bollard::service::MountTypeEnum::BIND,
                    MountType::Volume => bollard::service::MountTypeEnum::VOLUME,
                    MountType::Tmpfs => bollard::service::MountTypeEnum::TMPFS,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let mut host_config = HostConfig {
            mounts: (!mounts.is_empty()).then_some(mounts),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: config.network_mode.clone(),
            ..Default::default()
        };
        apply_resource_limits(&mut host_config, &config.resources);

        let networking_config = match (&config.network_mode, config.network_aliases.is_empty()) {
            (Some(network), false) => Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.clone(),
                    EndpointSettings {
                        aliases: Some(config.network_aliases.clone()),
                        ..Default::default()
                    },
                )]),
            }),
            _ => None,
        };

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: (!env.is_empty()).then_some(env),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            hostname: config.hostname.clone(),
            tty: Some(config.tty),
            open_stdin: Some(config.stdin_open),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let response = self
            .client
            .create_container(options, container_config)
            .await
            .map_err(|e| match ProviderError::from(e) {
                // 404 on create means the image is missing
                ProviderError::ContainerNotFound(message) => ProviderError::ImageNotFound(message),
                other => other,
            })?;

        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, timeout: Option<u32>) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.unwrap_or(10) as i64,
        };
        match self.client.stop_container(&id.0, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, config: &ExecConfig) -> Result<ExecResult> {
        let options = CreateExecOptions {
            cmd: Some(config.cmd.clone()),
            env: Some(
                config
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            tty: Some(config.tty),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(&id.0, options).await?;

        let start_options = StartExecOptions {
            detach: false,
            tty: config.tty,
            ..Default::default()
        };

        let result = self.client.start_exec(&exec.id, Some(start_options)).await?;

        let mut output_str = String::new();
        if let StartExecResults::Attached { mut output, .. } = result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::StdErr { message })
                    | Ok(bollard::container::LogOutput::Console { message }) => {
                        output_str.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(ProviderError::ExecError(e.to_string())),
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);

        Ok(ExecResult {
            exit_code,
            output: output_str,
        })
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails> {
        let info = self.client.inspect_container(&id.0, None).await?;

        let state = info.state.as_ref();
        let status = state
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(format!("{:?}", s).to_lowercase().as_str()))
            .unwrap_or(ContainerStatus::Unknown);

        let mut ports = Vec::new();
        let mut networks = HashMap::new();
        if let Some(settings) = &info.network_settings {
            for (container_port, bindings) in settings.ports.iter().flatten() {
                let mut parts = container_port.split('/');
                let port_num: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                let protocol = parts.next().unwrap_or("tcp").to_string();

                match bindings {
                    Some(bindings) => {
                        for binding in bindings {
                            ports.push(PortInfo {
                                container_port: port_num,
                                host_port: binding.host_port.as_ref().and_then(|p| p.parse().ok()),
                                protocol: protocol.clone(),
                                host_ip: binding.host_ip.clone(),
                            });
                        }
                    }
                    None => ports.push(PortInfo {
                        container_port: port_num,
                        host_port: None,
                        protocol,
                        host_ip: None,
                    }),
                }
            }

            for (name, endpoint) in settings.networks.iter().flatten() {
                networks.insert(
                    name.clone(),
                    EndpointInfo {
                        network_id: endpoint.network_id.clone().unwrap_or_default(),
                        ip_address: endpoint.ip_address.clone().filter(|ip| !ip.is_empty()),
                        aliases: endpoint.aliases.clone().unwrap_or_default(),
                    },
                );
            }
        }

        let started_at = state
            .and_then(|s| s.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());

        let config = info.config.as_ref();

        Ok(ContainerDetails {
            id: ContainerId::new(info.id.clone().unwrap_or_else(|| id.0.clone())),
            name: info
                .name
                .clone()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
            status,
            created: info
                .created
                .as_ref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp())
                .unwrap_or(0),
            started_at,
            exit_code: state.and_then(|s| s.exit_code),
            labels: config.and_then(|c| c.labels.clone()).unwrap_or_default(),
            ports,
            networks,
        })
    }

    async fn create_network(&self, config: &CreateNetworkConfig) -> Result<String> {
        let options = CreateNetworkOptions {
            name: config.name.clone(),
            driver: config
                .driver
                .clone()
                .unwrap_or_else(|| "bridge".to_string()),
            internal: config.internal,
            attachable: config.attachable,
            labels: config.labels.clone(),
            options: config.options.clone(),
            ..Default::default()
        };

        self.client
            .create_network(options)
            .await
            .map_err(|e| network_err(e, &config.name))?;

        // The create response's id is optional across API versions
        let created = self.inspect_network(&config.name).await?;
        tracing::debug!("Created network {} ({})", created.name, created.id);
        Ok(created.id)
    }

    async fn remove_network(&self, id_or_name: &str) -> Result<()> {
        self.client
            .remove_network(id_or_name)
            .await
            .map_err(|e| network_err(e, id_or_name))
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo> {
        let network = self
            .client
            .inspect_network(id_or_name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| network_err(e, id_or_name))?;
        Ok(network_info(network))
    }

    async fn list_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<NetworkInfo>> {
        let options = ListNetworksOptions {
            filters: label_filters(labels),
        };
        let networks = self.client.list_networks(Some(options)).await?;
        Ok(networks.into_iter().map(network_info).collect())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &ContainerId,
        aliases: &[String],
    ) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.0.clone(),
            endpoint_config: EndpointSettings {
                aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                ..Default::default()
            },
        };
        self.client
            .connect_network(network, options)
            .await
            .map_err(|e| network_err(e, network))
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        force: bool,
    ) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: container.0.clone(),
            force,
        };
        self.client
            .disconnect_network(network, options)
            .await
            .map_err(|e| network_err(e, network))
    }

    async fn prune_networks(&self, labels: &HashMap<String, String>) -> Result<Vec<String>> {
        let options = PruneNetworksOptions {
            filters: label_filters(labels),
        };
        let response = self.client.prune_networks(Some(options)).await?;
        Ok(response.networks_deleted.unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider_type: self.provider_type,
            version: "unknown".to_string(),
            api_version: bollard::API_DEFAULT_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Translate resource limits onto the host config
fn apply_resource_limits(host_config: &mut HostConfig, limits: &ResourceLimits) {
    host_config.memory = limits.memory.filter(|m| *m > 0);
    host_config.nano_cpus = limits.nano_cpus.filter(|n| *n > 0);

    if let Some(gpus) = &limits.gpus {
        let (count, device_ids) = match gpus {
            GpuRequest::All => (Some(-1), None),
            GpuRequest::Count(n) => (Some(*n), None),
            GpuRequest::Devices(ids) => (None, Some(ids.clone())),
        };
        host_config.device_requests = Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count,
            device_ids,
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]);
    }
}

/// `label=key=value` filters for list/prune
fn label_filters(labels: &HashMap<String, String>) -> HashMap<String, Vec<String>> {
    if labels.is_empty() {
        return HashMap::new();
    }
    let mut values: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    values.sort();
    HashMap::from([("label".to_string(), values)])
}

fn network_info(network: bollard::service::Network) -> NetworkInfo {
    NetworkInfo {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver.unwrap_or_default(),
        scope: network.scope.unwrap_or_default(),
        internal: network.internal.unwrap_or(false),
        containers: network
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(|(id, container)| (id, container.name.unwrap_or_default()))
            .collect(),
        labels: network.labels.unwrap_or_default(),
        created_at: network
            .created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
    }
}

/// Tar up a build context directory
fn create_build_context(context: &Path) -> Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(std::io::Cursor::new(&mut tar_data));
        add_dir_to_tar(&mut builder, context, Path::new(""))?;
        builder.finish()?;
    }
    Ok(tar_data)
}

/// Recursively add directory contents to tar
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    prefix: &Path,
) -> Result<()> {
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());

        let file_name = entry.file_name();
        if matches!(
            file_name.to_string_lossy().as_ref(),
            ".git" | "node_modules" | "target"
        ) {
            continue;
        }

        if path.is_dir() {
            add_dir_to_tar(builder, &path, &name)?;
        } else if path.is_file() {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_context_skips_vcs_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".devcontainer")).unwrap();
        std::fs::write(dir.path().join(".devcontainer/setup.sh"), "true\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref\n").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/big"), "x").unwrap();

        let data = create_build_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(data));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names, vec![".devcontainer/setup.sh", "Dockerfile"]);
    }

    #[test]
    fn test_label_filters() {
        assert!(label_filters(&HashMap::new()).is_empty());

        let labels = HashMap::from([
            ("cm.managed_by".to_string(), "container-maker".to_string()),
            ("cm.project".to_string(), "/src/app".to_string()),
        ]);
        let filters = label_filters(&labels);
        assert_eq!(
            filters.get("label").unwrap(),
            &vec![
                "cm.managed_by=container-maker".to_string(),
                "cm.project=/src/app".to_string()
            ]
        );
    }

    #[test]
    fn test_resource_limits_translation() {
        let mut host_config = HostConfig::default();
        apply_resource_limits(
            &mut host_config,
            &ResourceLimits {
                memory: Some(512 * 1024 * 1024),
                nano_cpus: Some(1_500_000_000),
                gpus: Some(GpuRequest::Devices(vec!["0".into(), "1".into()])),
            },
        );

        assert_eq!(host_config.memory, Some(512 * 1024 * 1024));
        assert_eq!(host_config.nano_cpus, Some(1_500_000_000));
        let request = &host_config.device_requests.unwrap()[0];
        assert_eq!(request.count, None);
        assert_eq!(request.device_ids, Some(vec!["0".to_string(), "1".to_string()]));
        assert_eq!(request.capabilities, Some(vec![vec!["gpu".to_string()]]));
    }

    #[test]
    fn test_all_gpus_and_unset_limits() {
        let mut host_config = HostConfig::default();
        apply_resource_limits(
            &mut host_config,
            &ResourceLimits {
                memory: Some(0),
                nano_cpus: None,
                gpus: Some(GpuRequest::All),
            },
        );

        assert_eq!(host_config.memory, None);
        assert_eq!(host_config.nano_cpus, None);
        assert_eq!(host_config.device_requests.unwrap()[0].count, Some(-1));
    }

    #[test]
    fn test_network_info_mapping() {
        let network = bollard::service::Network {
            id: Some("abc123".to_string()),
            name: Some("cm-web".to_string()),
            driver: Some("bridge".to_string()),
            created: Some("2024-05-01T10:00:00Z".to_string()),
            containers: Some(HashMap::from([(
                "c1".to_string(),
                bollard::service::NetworkContainer {
                    name: Some("cm-web".to_string()),
                    ..Default::default()
                },
            )])),
            ..Default::default()
        };

        let info = network_info(network);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.containers.get("c1").map(String::as_str), Some("cm-web"));
        assert!(!info.internal);
        assert!(info.created_at.is_some());
    }
}

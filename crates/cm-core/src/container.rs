//! Translation of environments into container runtime requests

use crate::{cpu_to_nano, parse_memory, Environment, Result};
use crate::{LABEL_ENV_ID, LABEL_ENV_NAME, LABEL_MANAGED_BY, MANAGED_BY, NETWORK_PREFIX};
use cm_config::EnvironmentConfig;
use cm_provider::{
    ContainerId, ContainerProvider, CreateContainerConfig, ExecConfig, GpuRequest, MountConfig,
    MountType, PortConfig, ResourceLimits,
};
use std::collections::HashMap;

/// Root under which project directories are mounted
pub const WORKSPACES_ROOT: &str = "/workspaces";

/// Name of an environment's container
pub fn container_name(env_name: &str) -> String {
    format!("{}{}", NETWORK_PREFIX, env_name)
}

/// Tag for images built from an environment's Dockerfile
pub fn build_image_tag(env_name: &str) -> String {
    // Image references must be lowercase
    format!("cm/{}:latest", env_name.to_lowercase())
}

/// Where the project directory appears inside the container
pub fn workspace_folder(env: &Environment, config: &EnvironmentConfig) -> String {
    if let Some(ref folder) = config.workspace_folder {
        return folder.clone();
    }
    let base = env
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());
    format!("{}/{}", WORKSPACES_ROOT, base)
}

/// GPU request for an environment: explicit devices win over a count
pub fn gpu_request(env: &Environment) -> Option<GpuRequest> {
    if !env.gpus.is_empty() {
        return Some(GpuRequest::Devices(
            env.gpus.iter().map(|g| g.to_string()).collect(),
        ));
    }
    match env.gpu_count {
        Some(0) | None => None,
        Some(n) => Some(GpuRequest::Count(i64::from(n))),
    }
}

/// Translate resource requests into runtime limits
pub fn resource_limits(env: &Environment) -> Result<ResourceLimits> {
    Ok(ResourceLimits {
        memory: env.memory_limit.as_deref().map(parse_memory).transpose()?,
        nano_cpus: env.cpu_limit.map(cpu_to_nano).transpose()?,
        gpus: gpu_request(env),
    })
}

/// Build the container creation request for an environment
///
/// The container sleeps forever so that shells and commands can be exec'd
/// into it, and joins the environment's own network under its name.
pub fn create_config(
    env: &Environment,
    config: &EnvironmentConfig,
    image: &str,
) -> Result<CreateContainerConfig> {
    let workdir = workspace_folder(env, config);

    let mut mounts = vec![MountConfig {
        mount_type: MountType::Bind,
        source: env.project_dir.to_string_lossy().to_string(),
        target: workdir.clone(),
        read_only: false,
    }];
    for mount in &config.mounts {
        match parse_mount_string(mount) {
            Some(m) => mounts.push(m),
            None => tracing::warn!("Ignoring mount without target: {}", mount),
        }
    }

    let ports = config
        .forward_ports
        .iter()
        .map(|&port| PortConfig {
            host_port: Some(port),
            container_port: port,
            protocol: "tcp".to_string(),
            host_ip: Some("127.0.0.1".to_string()),
        })
        .collect();

    let mut env_vars = config.container_env.clone();
    env_vars.insert("TERM".to_string(), "xterm-256color".to_string());

    let mut labels: HashMap<String, String> = env
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_ENV_ID.to_string(), env.id.clone());
    labels.insert(LABEL_ENV_NAME.to_string(), env.name.clone());

    Ok(CreateContainerConfig {
        image: image.to_string(),
        name: Some(container_name(&env.name)),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        env: env_vars,
        working_dir: Some(workdir),
        user: config.remote_user.clone(),
        mounts,
        ports,
        labels,
        hostname: Some(env.name.clone()),
        tty: true,
        stdin_open: true,
        network_mode: env.network_name.clone(),
        network_aliases: vec![env.name.clone()],
        resources: resource_limits(env)?,
    })
}

/// Parse a mount string like "type=bind,source=/path,target=/path"
pub fn parse_mount_string(s: &str) -> Option<MountConfig> {
    let mut mount_type = MountType::Bind;
    let mut source = String::new();
    let mut target = String::new();
    let mut read_only = false;

    for part in s.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            // Bare `readonly` flag
            if matches!(part.trim(), "readonly" | "ro") {
                read_only = true;
            }
            continue;
        };

        match key.trim() {
            "type" => {
                mount_type = match value {
                    "volume" => MountType::Volume,
                    "tmpfs" => MountType::Tmpfs,
                    _ => MountType::Bind,
                };
            }
            "source" | "src" => source = value.to_string(),
            "target" | "dst" | "destination" => target = value.to_string(),
            "readonly" | "ro" => read_only = value == "true" || value == "1",
            _ => {}
        }
    }

    if target.is_empty() {
        return None;
    }

    Some(MountConfig {
        mount_type,
        source,
        target,
        read_only,
    })
}

/// Exec request running `cmd` through `sh -c`
pub fn shell_exec_config(cmd: &str, user: Option<&str>, working_dir: Option<&str>) -> ExecConfig {
    ExecConfig {
        cmd: vec!["sh".to_string(), "-c".to_string(), cmd.to_string()],
        env: HashMap::new(),
        working_dir: working_dir.map(|s| s.to_string()),
        user: user.map(|s| s.to_string()),
        tty: false,
    }
}

/// Run lifecycle commands in order, logging failures instead of returning
/// them
///
/// Returns how many commands failed.
pub async fn run_lifecycle_commands(
    provider: &dyn ContainerProvider,
    container_id: &ContainerId,
    commands: &[String],
    user: Option<&str>,
    working_dir: Option<&str>,
) -> usize {
    let mut failed = 0;
    for cmd in commands {
        tracing::debug!("Running lifecycle command: {}", cmd);
        let config = shell_exec_config(cmd, user, working_dir);
        match provider.exec(container_id, &config).await {
            Ok(result) if result.exit_code == 0 => {}
            Ok(result) => {
                failed += 1;
                tracing::warn!(
                    "Lifecycle command '{}' exited with code {}",
                    cmd,
                    result.exit_code
                );
            }
            Err(e) => {
                failed += 1;
                tracing::warn!("Lifecycle command '{}' failed: {}", cmd, e);
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCall, MockOp, MockProvider};
    use crate::ErrorCode;
    use cm_provider::ProviderError;

    fn env() -> Environment {
        let mut env = Environment::new("web", "/home/dev/shop");
        env.network_name = Some("cm-web".into());
        env
    }

    #[test]
    fn test_names() {
        assert_eq!(container_name("web"), "cm-web");
        assert_eq!(build_image_tag("MyApp"), "cm/myapp:latest");
    }

    #[test]
    fn test_create_config_defaults() {
        let env = env();
        let config = EnvironmentConfig::from_image("python:3.11");

        let cfg = create_config(&env, &config, "python:3.11").unwrap();

        assert_eq!(cfg.name.as_deref(), Some("cm-web"));
        assert_eq!(
            cfg.cmd,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        assert_eq!(cfg.working_dir.as_deref(), Some("/workspaces/shop"));
        assert_eq!(cfg.mounts.len(), 1);
        assert_eq!(cfg.mounts[0].source, "/home/dev/shop");
        assert_eq!(cfg.mounts[0].target, "/workspaces/shop");
        assert_eq!(cfg.network_mode.as_deref(), Some("cm-web"));
        assert_eq!(cfg.network_aliases, vec!["web".to_string()]);
        assert_eq!(cfg.labels[LABEL_MANAGED_BY], MANAGED_BY);
        assert_eq!(cfg.labels[LABEL_ENV_ID], env.id);
        assert_eq!(cfg.labels[LABEL_ENV_NAME], "web");
        assert!(cfg.tty && cfg.stdin_open);
        assert_eq!(cfg.resources, ResourceLimits::default());
    }

    #[test]
    fn test_create_config_from_devcontainer_fields() {
        let env = env();
        let mut config = EnvironmentConfig::from_image("node:20");
        config.workspace_folder = Some("/app".into());
        config.remote_user = Some("node".into());
        config.forward_ports = vec![3000];
        config
            .container_env
            .insert("NODE_ENV".into(), "development".into());
        config.mounts = vec![
            "type=volume,source=cache,target=/root/.cache".into(),
            "source=/tmp".into(),
        ];

        let cfg = create_config(&env, &config, "node:20").unwrap();

        assert_eq!(cfg.working_dir.as_deref(), Some("/app"));
        assert_eq!(cfg.user.as_deref(), Some("node"));
        assert_eq!(cfg.env["NODE_ENV"], "development");
        assert_eq!(cfg.env["TERM"], "xterm-256color");
        assert_eq!(cfg.ports.len(), 1);
        assert_eq!(cfg.ports[0].host_port, Some(3000));
        // The mount without a target is dropped
        assert_eq!(cfg.mounts.len(), 2);
        assert_eq!(cfg.mounts[1].mount_type, MountType::Volume);
    }

    #[test]
    fn test_resource_translation() {
        let mut env = env();
        env.memory_limit = Some("512m".into());
        env.cpu_limit = Some(1.5);
        env.gpus = vec![0, 2];

        let limits = resource_limits(&env).unwrap();
        assert_eq!(limits.memory, Some(512 * 1024 * 1024));
        assert_eq!(limits.nano_cpus, Some(1_500_000_000));
        assert_eq!(
            limits.gpus,
            Some(GpuRequest::Devices(vec!["0".into(), "2".into()]))
        );

        env.gpus.clear();
        env.gpu_count = Some(2);
        assert_eq!(gpu_request(&env), Some(GpuRequest::Count(2)));
        env.gpu_count = Some(0);
        assert_eq!(gpu_request(&env), None);
    }

    #[test]
    fn test_bad_memory_limit_is_invalid_config() {
        let mut env = env();
        env.memory_limit = Some("lots".into());
        let err = resource_limits(&env).unwrap_err();
        assert!(err.is(ErrorCode::InvalidConfig));
    }

    #[test]
    fn test_parse_mount_string() {
        let mount =
            parse_mount_string("type=bind,source=/host/path,target=/container/path,readonly=true")
                .unwrap();
        assert_eq!(mount.mount_type, MountType::Bind);
        assert_eq!(mount.source, "/host/path");
        assert_eq!(mount.target, "/container/path");
        assert!(mount.read_only);

        let mount = parse_mount_string("type=tmpfs,dst=/scratch,ro").unwrap();
        assert_eq!(mount.mount_type, MountType::Tmpfs);
        assert!(mount.read_only);

        assert!(parse_mount_string("source=/only").is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_failures_are_counted_not_returned() {
        let mock = MockProvider::default();
        let id = ContainerId::new(mock.add_running_container("cm-web", None));
        let commands = vec!["npm install".to_string(), "npm test".to_string()];

        mock.set_exec_result(1, "boom");
        let failed = run_lifecycle_commands(&mock, &id, &commands, None, Some("/app")).await;
        assert_eq!(failed, 2);

        mock.set_exec_result(0, "");
        mock.fail_on(MockOp::Exec, ProviderError::ExecError("gone".into()));
        let failed = run_lifecycle_commands(&mock, &id, &commands[..1], None, None).await;
        assert_eq!(failed, 1);

        assert!(mock.was_called(&MockCall::Exec {
            id: id.0.clone(),
            cmd: vec!["sh".into(), "-c".into(), "npm install".into()],
        }));
    }
}

//! Shell and command execution for EnvironmentManager

use crate::{workspace_folder, CoreError, Environment, ErrorCode, Result};
use cm_config::EnvironmentConfig;
use cm_provider::{ContainerId, ExecConfig, ExecResult};
use std::collections::HashMap;

use super::EnvironmentManager;

/// Where an interactive shell should attach
///
/// The caller owns the terminal, so it runs the runtime CLI itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    /// Runtime CLI, `docker` or `podman`
    pub program: String,
    pub container: String,
    pub shell: String,
    pub user: Option<String>,
    pub workdir: Option<String>,
}

impl ShellTarget {
    /// Arguments for `program`: `exec -it [-u user] [-w dir] <container> <shell>`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-it".to_string()];
        if let Some(ref user) = self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        if let Some(ref workdir) = self.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        args.push(self.container.clone());
        args.push(self.shell.clone());
        args
    }
}

impl EnvironmentManager {
    /// Prepare an interactive shell, starting the environment if needed
    pub async fn shell(&self, name_or_id: &str, shell: Option<&str>) -> Result<ShellTarget> {
        let mut env = self.get(name_or_id).await?;
        if !env.is_running() {
            self.start(&env.id).await?;
            env = self.store.load(&env.id)?;
        }

        let container = running_container(&env)?;
        let (user, workdir) = self.exec_context(&env);
        let shell = shell
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.global_config.defaults.shell)
            .to_string();

        Ok(ShellTarget {
            program: self.provider.info().provider_type.program().to_string(),
            container: env.container_name.clone().unwrap_or(container),
            shell,
            user,
            workdir: Some(workdir),
        })
    }

    /// Run a command in a running environment and collect its output
    ///
    /// Unlike [`shell`](Self::shell) this never starts the environment.
    pub async fn exec(&self, name_or_id: &str, cmd: Vec<String>) -> Result<ExecResult> {
        let env = self.get(name_or_id).await?;
        if !env.is_running() {
            return Err(CoreError::new(ErrorCode::EnvStopped, "environment is not running")
                .with_env(env.id.as_str(), env.name.as_str()));
        }
        if cmd.is_empty() {
            return Err(CoreError::invalid_config("no command given"));
        }

        let container = running_container(&env)?;
        let (user, workdir) = self.exec_context(&env);
        let config = ExecConfig {
            cmd,
            env: HashMap::new(),
            working_dir: Some(workdir),
            user,
            tty: false,
        };
        Ok(self
            .provider
            .exec(&ContainerId::new(container), &config)
            .await?)
    }

    /// User and working directory from the project configuration, falling
    /// back to the default workspace folder
    fn exec_context(&self, env: &Environment) -> (Option<String>, String) {
        match self.loader.load(&env.project_dir, env.template.as_deref()) {
            Ok(config) => (config.remote_user.clone(), workspace_folder(env, &config)),
            Err(e) => {
                tracing::debug!("No configuration for {}: {}", env.name, e);
                let fallback = EnvironmentConfig::from_image("");
                (None, workspace_folder(env, &fallback))
            }
        }
    }
}

fn running_container(env: &Environment) -> Result<String> {
    env.container_id.clone().ok_or_else(|| {
        CoreError::new(ErrorCode::ContainerNotFound, "environment has no container")
            .with_env(env.id.as_str(), env.name.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_manager;
    use super::*;
    use crate::test_support::{MockCall, MockProvider, StaticLoader};
    use crate::{CreateOptions, EnvironmentStatus};
    use cm_provider::ProviderType;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn opts(name: &str) -> CreateOptions {
        CreateOptions {
            project_dir: Some(PathBuf::from(format!("/src/{}", name))),
            ..CreateOptions::new(name)
        }
    }

    #[test]
    fn test_shell_target_args() {
        let target = ShellTarget {
            program: "docker".into(),
            container: "cm-web".into(),
            shell: "/bin/bash".into(),
            user: Some("dev".into()),
            workdir: Some("/workspaces/web".into()),
        };
        assert_eq!(
            target.args(),
            vec!["exec", "-it", "-u", "dev", "-w", "/workspaces/web", "cm-web", "/bin/bash"]
        );

        let bare = ShellTarget {
            user: None,
            workdir: None,
            ..target
        };
        assert_eq!(bare.args(), vec!["exec", "-it", "cm-web", "/bin/bash"]);
    }

    #[tokio::test]
    async fn test_shell_starts_stopped_environment() {
        let mock = Arc::new(MockProvider::new(ProviderType::Podman));
        let (_store, manager) = test_manager(&mock, StaticLoader::image("alpine:3.19"));
        manager
            .create(CreateOptions {
                no_start: true,
                ..opts("web")
            })
            .await
            .unwrap();

        let target = manager.shell("web", None).await.unwrap();

        assert_eq!(target.program, "podman");
        assert_eq!(target.container, "cm-web");
        assert_eq!(target.shell, "/bin/sh");
        assert_eq!(target.workdir.as_deref(), Some("/workspaces/web"));
        assert_eq!(
            manager.get("web").await.unwrap().status,
            EnvironmentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_shell_uses_requested_shell_and_remote_user() {
        let mock = Arc::new(MockProvider::default());
        let mut config = EnvironmentConfig::from_image("node:20");
        config.remote_user = Some("node".into());
        config.workspace_folder = Some("/app".into());
        let (_store, manager) = test_manager(&mock, StaticLoader::with(config));
        manager.create(opts("web")).await.unwrap();

        let target = manager.shell("web", Some("/bin/zsh")).await.unwrap();
        assert_eq!(target.shell, "/bin/zsh");
        assert_eq!(target.user.as_deref(), Some("node"));
        assert_eq!(target.workdir.as_deref(), Some("/app"));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let mock = Arc::new(MockProvider::default());
        let (_store, manager) = test_manager(&mock, StaticLoader::image("alpine:3.19"));
        manager
            .create(CreateOptions {
                no_start: true,
                ..opts("web")
            })
            .await
            .unwrap();

        let err = manager
            .exec("web", vec!["ls".into()])
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::EnvStopped));
        assert!(err.suggestion.is_none());
        assert!(crate::format_user_error(&err).contains("cm env start"));
        // exec never starts anything
        assert_eq!(mock.container_count(), 0);
    }

    #[tokio::test]
    async fn test_exec_returns_output() {
        let mock = Arc::new(MockProvider::default());
        let (_store, manager) = test_manager(&mock, StaticLoader::image("alpine:3.19"));
        let env = manager.create(opts("web")).await.unwrap();
        mock.set_exec_result(3, "partial\n");

        let result = manager
            .exec("web", vec!["make".into(), "test".into()])
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "partial\n");
        assert!(mock.was_called(&MockCall::Exec {
            id: env.container_id.unwrap(),
            cmd: vec!["make".into(), "test".into()],
        }));

        let err = manager.exec("web", Vec::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidConfig));
    }
}

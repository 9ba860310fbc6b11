//! Create, start, stop and delete for EnvironmentManager

use crate::{
    build_image_tag, create_config, network_name, resource_limits, run_lifecycle_commands,
    validate_name, workspace_folder, CoreError, Environment, EnvironmentStatus, ErrorCode, Result,
    LABEL_ENV_ID, LABEL_MANAGED_BY, MANAGED_BY,
};
use cm_config::{EnvironmentConfig, ImageSpec};
use cm_provider::{BuildConfig, ContainerId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{resolve_project_dir, CreateOptions, EnvironmentManager, LinkOptions};

impl EnvironmentManager {
    /// Create an environment, its network and (unless `no_start`) its
    /// running container
    ///
    /// A failure after the record was first saved leaves the environment in
    /// the ledger with `Error` status, and the failure is returned.
    pub async fn create(&self, opts: CreateOptions) -> Result<Environment> {
        validate_name(&opts.name)?;

        if let Ok(existing) = self.store.get_by_name(&opts.name) {
            if !opts.force {
                return Err(CoreError::env_exists(&opts.name));
            }
            info!("Replacing existing environment {}", opts.name);
            self.delete(&existing.id, true).await?;
        }

        let project_dir = resolve_project_dir(opts.project_dir.as_deref())?;
        let mut env = Environment::new(opts.name.as_str(), project_dir);
        env.template = opts.template.clone().filter(|t| !t.is_empty());
        env.gpus = opts.gpus.clone();
        env.gpu_count = opts.gpu_count;
        env.memory_limit = opts.memory.clone();
        env.cpu_limit = opts.cpu;
        env.labels = opts.labels.clone();
        env.tags = opts.tags.clone();
        env.backend = self.provider.info().provider_type.to_string();
        env.ports = opts
            .expose_ports
            .iter()
            .map(|p| (p.to_string(), *p))
            .collect();

        // Reject bad resource requests before anything is created
        resource_limits(&env)?;

        let network_id = self.networks.create_environment_network(&env).await?;
        env.network_id = Some(network_id.clone());
        env.network_name = Some(network_name(&env.name));

        if let Err(e) = self.store.save(&mut env) {
            if let Err(cleanup) = self.networks.force_delete_network(&network_id).await {
                warn!("Failed to remove network of {}: {}", env.name, cleanup);
            }
            return Err(e);
        }

        let outcome = if opts.no_start {
            env.transition(EnvironmentStatus::Stopped, None)
        } else {
            self.provision(&mut env).await
        };

        if let Err(e) = outcome {
            env.fail(e.cause_chain());
            if let Err(save_err) = self.store.save(&mut env) {
                warn!("Failed to record error for {}: {}", env.name, save_err);
            }
            return Err(with_env_context(e, &env));
        }
        self.store.save(&mut env)?;
        info!("Created environment {} ({})", env.name, env.id);

        for target in &opts.link_to {
            let linked = self
                .link(&env.id, target, LinkOptions { bidirectional: true })
                .await;
            if let Err(e) = linked {
                warn!("Failed to link {} to {}: {}", env.name, target, e);
            }
        }

        self.store.load(&env.id)
    }

    /// Resolve configuration and image, then create and start the container
    /// and run its lifecycle commands
    async fn provision(&self, env: &mut Environment) -> Result<()> {
        let mut config = self
            .loader
            .load(&env.project_dir, env.template.as_deref())?;
        env.config_file = config.config_file.clone();

        for port in env.ports.values() {
            if !config.forward_ports.contains(port) {
                config.forward_ports.push(*port);
            }
        }

        let image = self.resolve_image(env, &config).await?;
        let request = create_config(env, &config, &image)?;

        let container_id = self.provider.create(&request).await?;
        debug!("Created container {} for {}", container_id.short(), env.name);
        env.container_id = Some(container_id.0.clone());
        env.container_name = request.name.clone();
        env.image_tag = Some(image);
        env.ports = config
            .forward_ports
            .iter()
            .map(|p| (p.to_string(), *p))
            .collect();

        self.provider.start(&container_id).await?;
        self.attach_linked_networks(env).await;

        let workdir = workspace_folder(env, &config);
        let user = config.remote_user.as_deref();
        run_lifecycle_commands(
            self.provider.as_ref(),
            &container_id,
            &config.post_create_commands,
            user,
            Some(&workdir),
        )
        .await;
        run_lifecycle_commands(
            self.provider.as_ref(),
            &container_id,
            &config.post_start_commands,
            user,
            Some(&workdir),
        )
        .await;

        env.transition(EnvironmentStatus::Running, None)
    }

    /// Image to run: pulled when missing locally, or built and tagged
    /// `cm/<name>:latest`
    async fn resolve_image(&self, env: &Environment, config: &EnvironmentConfig) -> Result<String> {
        match &config.image {
            ImageSpec::Image(image) => {
                if self.provider.image_exists(image).await? {
                    debug!("Image {} present locally", image);
                } else {
                    info!("Pulling image {}", image);
                    self.provider.pull(image).await?;
                }
                Ok(image.clone())
            }
            ImageSpec::Build {
                context,
                dockerfile,
                args,
            } => {
                let tag = build_image_tag(&env.name);
                info!("Building image {} from {}", tag, dockerfile);
                let build = BuildConfig {
                    context: context.clone(),
                    dockerfile: dockerfile.clone(),
                    tag: tag.clone(),
                    build_args: args.clone(),
                    labels: HashMap::from([
                        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
                        (LABEL_ENV_ID.to_string(), env.id.clone()),
                    ]),
                    no_cache: false,
                    pull: true,
                };
                self.provider.build(&build).await?;
                Ok(tag)
            }
        }
    }

    /// Connect a freshly provisioned container to the networks of
    /// environments it was linked with earlier
    async fn attach_linked_networks(&self, env: &Environment) {
        if env.linked_envs.is_empty() {
            return;
        }
        let linked: Vec<Environment> = env
            .linked_envs
            .iter()
            .filter_map(|id| self.store.load(id).ok())
            .collect();
        if let Err(e) = self.networks.attach_links(env, &linked).await {
            warn!("Failed to restore links of {}: {}", env.name, e);
        }
    }

    /// Start an environment, provisioning its container if it never had one
    ///
    /// Starting a running environment does nothing.
    pub async fn start(&self, name_or_id: &str) -> Result<()> {
        let mut env = self.get(name_or_id).await?;
        if env.is_running() {
            return Ok(());
        }

        let started = match env.container_id.clone() {
            Some(id) => self.start_existing(&mut env, ContainerId::new(id)).await,
            None if matches!(
                env.status,
                EnvironmentStatus::Stopped | EnvironmentStatus::Creating
            ) =>
            {
                match self.networks.ensure_environment_network(&mut env).await {
                    Ok(_) => self.provision(&mut env).await,
                    Err(e) => Err(e),
                }
            }
            None => {
                return Err(CoreError::new(
                    ErrorCode::ContainerNotFound,
                    "environment has no container",
                )
                .with_env(env.id.as_str(), env.name.as_str())
                .with_suggestion(format!(
                    "Recreate it with 'cm env create {} --force'",
                    env.name
                )));
            }
        };

        if let Err(e) = started {
            env.fail(e.cause_chain());
            if let Err(save_err) = self.store.save(&mut env) {
                warn!("Failed to record error for {}: {}", env.name, save_err);
            }
            return Err(with_env_context(e, &env));
        }

        self.store.save(&mut env)?;
        info!("Started environment {}", env.name);
        Ok(())
    }

    async fn start_existing(&self, env: &mut Environment, id: ContainerId) -> Result<()> {
        self.provider.start(&id).await?;

        // postStartCommand runs on every start
        match self.loader.load(&env.project_dir, env.template.as_deref()) {
            Ok(config) => {
                let workdir = workspace_folder(env, &config);
                run_lifecycle_commands(
                    self.provider.as_ref(),
                    &id,
                    &config.post_start_commands,
                    config.remote_user.as_deref(),
                    Some(&workdir),
                )
                .await;
            }
            Err(e) => debug!("Skipping postStartCommand of {}: {}", env.name, e),
        }

        env.transition(EnvironmentStatus::Running, None)
    }

    /// Stop a running environment; `timeout` defaults to the configured
    /// grace period
    ///
    /// Stopping an environment that is not running does nothing.
    pub async fn stop(&self, name_or_id: &str, timeout: Option<u32>) -> Result<()> {
        let mut env = self.get(name_or_id).await?;
        if !matches!(
            env.status,
            EnvironmentStatus::Running | EnvironmentStatus::Paused
        ) {
            return Ok(());
        }

        if let Some(ref id) = env.container_id {
            let timeout = timeout.unwrap_or(self.global_config.defaults.stop_timeout);
            self.provider
                .stop(&ContainerId::new(id.as_str()), Some(timeout))
                .await
                .map_err(|e| with_env_context(e.into(), &env))?;
        }

        env.transition(EnvironmentStatus::Stopped, None)?;
        self.store.save(&mut env)?;
        info!("Stopped environment {}", env.name);
        Ok(())
    }

    /// Stop then start; a failed stop aborts the restart
    pub async fn restart(&self, name_or_id: &str) -> Result<()> {
        self.stop(name_or_id, Some(10)).await?;
        self.start(name_or_id).await
    }

    /// Delete an environment with its container and network
    ///
    /// Running environments are only deleted with `force`. Returns the name
    /// of the network when it could not be removed.
    pub async fn delete(&self, name_or_id: &str, force: bool) -> Result<Option<String>> {
        let env = self.get(name_or_id).await?;

        if env.is_running() {
            if !force {
                return Err(CoreError::new(ErrorCode::EnvRunning, "environment is running")
                    .with_env(env.id.as_str(), env.name.as_str())
                    .with_suggestion(
                        "Stop the environment first with 'cm env stop' or use --force",
                    ));
            }
            if let Err(e) = self.stop(&env.id, Some(5)).await {
                warn!("Failed to stop {} before deleting: {}", env.name, e);
            }
        }

        let leaked = self.teardown(&env, force).await?;
        self.store.delete(&env.id)?;
        self.forget_links(&env.id);
        info!("Deleted environment {}", env.name);
        Ok(leaked)
    }

    /// Remove an environment's container and network
    ///
    /// A container that is already gone counts as removed. Network removal
    /// is best-effort; a network left behind is returned by name.
    pub(crate) async fn teardown(&self, env: &Environment, force: bool) -> Result<Option<String>> {
        if let Some(ref id) = env.container_id {
            match self.provider.remove(&ContainerId::new(id.as_str()), force).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Container of {} already gone", env.name),
                Err(e) => return Err(with_env_context(e.into(), env)),
            }
        }

        let Some(ref network) = env.network_id else {
            return Ok(None);
        };
        match self.networks.force_delete_network(network).await {
            Ok(()) => Ok(None),
            Err(e) if e.is(ErrorCode::NetworkNotFound) => {
                debug!("Network of {} already gone", env.name);
                Ok(None)
            }
            Err(e) => {
                warn!("Failed to remove network of {}: {}", env.name, e);
                Ok(Some(env.network_name.clone().unwrap_or_else(|| network.clone())))
            }
        }
    }
}

fn with_env_context(err: CoreError, env: &Environment) -> CoreError {
    if err.env_id.is_some() || err.env_name.is_some() {
        err
    } else {
        err.with_env(env.id.as_str(), env.name.as_str())
    }
}

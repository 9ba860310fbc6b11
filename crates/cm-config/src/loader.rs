//! Normalized environment configuration
//!
//! [`ConfigLoader`] turns whatever a project ships (devcontainer.json, or
//! nothing plus a template name) into an [`EnvironmentConfig`] whose shape
//! never varies. Lifecycle commands in particular are always plain lists of
//! shell lines here.

use crate::{ConfigError, DevContainerConfig, ImageSource, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Well-known template names and the images they resolve to
pub const TEMPLATE_IMAGES: &[(&str, &str)] = &[
    ("python", "mcr.microsoft.com/devcontainers/python:3.11"),
    ("node", "mcr.microsoft.com/devcontainers/javascript-node:20"),
    ("go", "mcr.microsoft.com/devcontainers/go:1.21"),
    ("rust", "mcr.microsoft.com/devcontainers/rust:latest"),
    ("java", "mcr.microsoft.com/devcontainers/java:17"),
    ("cpp", "mcr.microsoft.com/devcontainers/cpp:latest"),
    ("dotnet", "mcr.microsoft.com/devcontainers/dotnet:8.0"),
    ("pytorch", "pytorch/pytorch:latest"),
    ("tensorflow", "tensorflow/tensorflow:latest-gpu"),
    ("ubuntu", "ubuntu:22.04"),
];

/// Resolve a template name to an image; unknown names are taken as image
/// references verbatim
pub fn template_image(template: &str) -> String {
    let lower = template.to_lowercase();
    TEMPLATE_IMAGES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, image)| image.to_string())
        .unwrap_or_else(|| template.to_string())
}

/// How to obtain the environment's image
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSpec {
    /// Pull (or reuse) a registry image
    Image(String),
    /// Build from a Dockerfile
    Build {
        /// Absolute build context
        context: PathBuf,
        /// Dockerfile path relative to `context`
        dockerfile: String,
        args: HashMap<String, String>,
    },
}

/// Everything environment provisioning needs from project configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub image: ImageSpec,
    /// The devcontainer.json this came from, if any
    pub config_file: Option<PathBuf>,
    /// Extra mounts in docker `--mount` string form
    pub mounts: Vec<String>,
    pub container_env: HashMap<String, String>,
    pub forward_ports: Vec<u16>,
    pub remote_user: Option<String>,
    pub workspace_folder: Option<String>,
    pub post_create_commands: Vec<String>,
    pub post_start_commands: Vec<String>,
}

impl EnvironmentConfig {
    /// Bare configuration running a single image
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: ImageSpec::Image(image.into()),
            config_file: None,
            mounts: Vec::new(),
            container_env: HashMap::new(),
            forward_ports: Vec::new(),
            remote_user: None,
            workspace_folder: None,
            post_create_commands: Vec::new(),
            post_start_commands: Vec::new(),
        }
    }
}

/// Source of environment configuration
pub trait ConfigLoader: Send + Sync {
    /// Load configuration for a project, using `template` when the project
    /// has no devcontainer.json
    fn load(&self, project_dir: &Path, template: Option<&str>) -> Result<EnvironmentConfig>;
}

/// Loads devcontainer.json from the project directory
#[derive(Debug, Clone, Default)]
pub struct DevcontainerLoader;

impl DevcontainerLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigLoader for DevcontainerLoader {
    fn load(&self, project_dir: &Path, template: Option<&str>) -> Result<EnvironmentConfig> {
        if let Some(path) = DevContainerConfig::find_in_dir(project_dir) {
            tracing::debug!("Loading {:?}", path);
            let config = DevContainerConfig::load_from(&path)?;
            return normalize(&config, &path);
        }

        match template.filter(|t| !t.is_empty()) {
            Some(template) => {
                let image = template_image(template);
                tracing::debug!("No devcontainer.json, template {} -> {}", template, image);
                Ok(EnvironmentConfig::from_image(image))
            }
            None => Err(ConfigError::NotFound(project_dir.to_path_buf())),
        }
    }
}

/// Convert a parsed devcontainer.json located at `path`
pub fn normalize(config: &DevContainerConfig, path: &Path) -> Result<EnvironmentConfig> {
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let image = match config.image_source() {
        ImageSource::Image(image) => ImageSpec::Image(image),
        ImageSource::Dockerfile {
            path: dockerfile,
            context,
            args,
        } => {
            let context_dir = normalize_path(&config_dir.join(context.as_deref().unwrap_or(".")));
            let dockerfile_path = normalize_path(&config_dir.join(&dockerfile));
            let dockerfile = match dockerfile_path.strip_prefix(&context_dir) {
                Ok(relative) => relative.to_string_lossy().into_owned(),
                Err(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "Dockerfile {} is outside the build context {}",
                        dockerfile_path.display(),
                        context_dir.display()
                    )))
                }
            };
            ImageSpec::Build {
                context: context_dir,
                dockerfile,
                args,
            }
        }
        ImageSource::Compose => {
            return Err(ConfigError::Invalid(
                "docker compose configurations are not supported for environments".to_string(),
            ))
        }
        ImageSource::None => {
            return Err(ConfigError::Invalid(format!(
                "{} specifies neither an image nor a build",
                path.display()
            )))
        }
    };

    Ok(EnvironmentConfig {
        image,
        config_file: Some(path.to_path_buf()),
        mounts: config
            .mounts
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|m| m.to_mount_string())
            .collect(),
        container_env: config.container_env.clone().unwrap_or_default(),
        forward_ports: config.forward_ports_list(),
        remote_user: config.effective_user().map(str::to_string),
        workspace_folder: config.workspace_folder.clone(),
        post_create_commands: config
            .post_create_command
            .as_ref()
            .map(|c| c.to_shell_commands())
            .unwrap_or_default(),
        post_start_commands: config
            .post_start_command
            .as_ref()
            .map(|c| c.to_shell_commands())
            .unwrap_or_default(),
    })
}

/// Resolve `.` and `..` lexically
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(config: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let devcontainer = dir.path().join(".devcontainer");
        std::fs::create_dir_all(&devcontainer).unwrap();
        std::fs::write(devcontainer.join("devcontainer.json"), config).unwrap();
        dir
    }

    #[test]
    fn test_template_image_lookup() {
        assert_eq!(template_image("python"), "mcr.microsoft.com/devcontainers/python:3.11");
        assert_eq!(template_image("Ubuntu"), "ubuntu:22.04");
        assert_eq!(template_image("alpine:3.19"), "alpine:3.19");
    }

    #[test]
    fn test_load_image_config() {
        let dir = project_with(
            r#"{
                "image": "ubuntu:22.04",
                "containerEnv": {"FOO": "bar"},
                "remoteUser": "dev",
                "workspaceFolder": "/work",
                "forwardPorts": [3000],
                "mounts": ["type=volume,source=cache,target=/cache"],
                "postCreateCommand": ["npm", "install"],
                "postStartCommand": "echo started"
            }"#,
        );

        let config = DevcontainerLoader::new().load(dir.path(), None).unwrap();
        assert_eq!(config.image, ImageSpec::Image("ubuntu:22.04".to_string()));
        assert_eq!(config.container_env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(config.remote_user.as_deref(), Some("dev"));
        assert_eq!(config.workspace_folder.as_deref(), Some("/work"));
        assert_eq!(config.forward_ports, vec![3000]);
        assert_eq!(config.mounts, vec!["type=volume,source=cache,target=/cache"]);
        assert_eq!(config.post_create_commands, vec!["npm install"]);
        assert_eq!(config.post_start_commands, vec!["echo started"]);
        assert!(config.config_file.unwrap().ends_with(".devcontainer/devcontainer.json"));
    }

    #[test]
    fn test_devcontainer_wins_over_template() {
        let dir = project_with(r#"{"image": "node:20"}"#);
        let config = DevcontainerLoader::new()
            .load(dir.path(), Some("python"))
            .unwrap();
        assert_eq!(config.image, ImageSpec::Image("node:20".to_string()));
    }

    #[test]
    fn test_template_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevcontainerLoader::new()
            .load(dir.path(), Some("rust"))
            .unwrap();
        assert_eq!(
            config.image,
            ImageSpec::Image("mcr.microsoft.com/devcontainers/rust:latest".to_string())
        );
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_no_config_no_template() {
        let dir = tempfile::tempdir().unwrap();
        let err = DevcontainerLoader::new().load(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));

        let err = DevcontainerLoader::new().load(dir.path(), Some("")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_build_paths_resolved_against_config_dir() {
        let dir = project_with(
            r#"{"build": {"dockerfile": "Dockerfile", "context": "..", "args": {"V": "1"}, "target": "dev"}}"#,
        );
        let config = DevcontainerLoader::new().load(dir.path(), None).unwrap();
        match config.image {
            ImageSpec::Build {
                context,
                dockerfile,
                args,
            } => {
                assert_eq!(context, normalize_path(dir.path()));
                assert_eq!(dockerfile, ".devcontainer/Dockerfile");
                assert_eq!(args.get("V").map(String::as_str), Some("1"));
            }
            other => panic!("unexpected image spec: {:?}", other),
        }
    }

    #[test]
    fn test_dockerfile_outside_context_rejected() {
        let dir = project_with(r#"{"build": {"dockerfile": "../Dockerfile", "context": "."}}"#);
        let err = DevcontainerLoader::new().load(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_compose_rejected() {
        let dir = project_with(r#"{"dockerComposeFile": "compose.yml", "service": "app"}"#);
        let err = DevcontainerLoader::new().load(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}

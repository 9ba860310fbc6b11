//! devcontainer.json parsing
//!
//! Only the fields an environment needs are modelled; everything else is
//! kept in `extra` so unknown keys never fail a parse.

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Locations searched inside a project directory, in order
pub const DEVCONTAINER_PATHS: &[&str] = &[
    ".devcontainer/devcontainer.json",
    "devcontainer.json",
    ".devcontainer.json",
];

/// devcontainer.json as written by the user
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevContainerConfig {
    pub name: Option<String>,

    pub image: Option<String>,

    /// Path to Dockerfile (relative to the config file)
    #[serde(alias = "dockerFile")]
    pub dockerfile: Option<String>,

    pub build: Option<BuildSection>,

    pub docker_compose_file: Option<StringOrArray>,

    pub container_env: Option<HashMap<String, String>>,

    pub remote_user: Option<String>,

    pub container_user: Option<String>,

    pub workspace_folder: Option<String>,

    pub mounts: Option<Vec<Mount>>,

    pub forward_ports: Option<Vec<PortMapping>>,

    pub app_port: Option<IntOrArray>,

    pub post_create_command: Option<Command>,

    pub post_start_command: Option<Command>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// `build` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildSection {
    pub dockerfile: Option<String>,
    pub context: Option<String>,
    pub args: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Mount entry: either the docker `--mount` string form or an object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mount {
    /// "type=bind,source=/path,target=/path"
    String(String),
    Object(MountObject),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountObject {
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    pub source: Option<String>,
    pub target: String,
    pub read_only: Option<bool>,
}

impl Mount {
    /// Render as a docker `--mount` style string
    pub fn to_mount_string(&self) -> String {
        match self {
            Mount::String(s) => s.clone(),
            Mount::Object(obj) => {
                let mut parts = vec![format!(
                    "type={}",
                    obj.mount_type.as_deref().unwrap_or("bind")
                )];
                if let Some(ref source) = obj.source {
                    parts.push(format!("source={}", source));
                }
                parts.push(format!("target={}", obj.target));
                if obj.read_only.unwrap_or(false) {
                    parts.push("readonly".to_string());
                }
                parts.join(",")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortMapping {
    Number(u16),
    Object(PortObject),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortObject {
    pub port: u16,
    pub label: Option<String>,
    pub protocol: Option<String>,
}

/// Lifecycle command: a shell string, an argv array, or named commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    String(String),
    Array(Vec<String>),
    Object(BTreeMap<String, StringOrArray>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    String(String),
    Array(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrArray {
    Int(u16),
    Array(Vec<u16>),
}

impl Command {
    /// Flatten into shell command lines, one per entry
    ///
    /// Named commands come out in key order.
    pub fn to_shell_commands(&self) -> Vec<String> {
        match self {
            Command::String(s) => non_empty(s.clone()),
            Command::Array(argv) => non_empty(shell_join(argv)),
            Command::Object(map) => map
                .values()
                .flat_map(|value| match value {
                    StringOrArray::String(s) => non_empty(s.clone()),
                    StringOrArray::Array(argv) => non_empty(shell_join(argv)),
                })
                .collect(),
        }
    }
}

fn non_empty(cmd: String) -> Vec<String> {
    if cmd.trim().is_empty() {
        Vec::new()
    } else {
        vec![cmd]
    }
}

/// Join argv into a single `sh -c` line, single-quoting where needed
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where the container image comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Image(String),
    Dockerfile {
        /// Dockerfile path as written in the config
        path: String,
        /// Build context as written in the config
        context: Option<String>,
        args: HashMap<String, String>,
    },
    Compose,
    None,
}

impl DevContainerConfig {
    /// Find and load devcontainer.json from a project directory
    pub fn load_from_dir(dir: &Path) -> Result<(Self, PathBuf)> {
        match Self::find_in_dir(dir) {
            Some(path) => {
                let config = Self::load_from(&path)?;
                Ok((config, path))
            }
            None => Err(ConfigError::NotFound(dir.to_path_buf())),
        }
    }

    /// First existing devcontainer.json candidate in `dir`
    pub fn find_in_dir(dir: &Path) -> Option<PathBuf> {
        DEVCONTAINER_PATHS
            .iter()
            .map(|candidate| dir.join(candidate))
            .find(|path| path.is_file())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse devcontainer.json content (JSONC)
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let content = strip_json_comments(content);

        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn image_source(&self) -> ImageSource {
        if let Some(ref image) = self.image {
            ImageSource::Image(image.clone())
        } else if let Some(ref dockerfile) = self.dockerfile {
            ImageSource::Dockerfile {
                path: dockerfile.clone(),
                context: self.build.as_ref().and_then(|b| b.context.clone()),
                args: HashMap::new(),
            }
        } else if let Some(ref build) = self.build {
            ImageSource::Dockerfile {
                path: build
                    .dockerfile
                    .clone()
                    .unwrap_or_else(|| "Dockerfile".to_string()),
                context: build.context.clone(),
                args: build.args.clone().unwrap_or_default(),
            }
        } else if self.docker_compose_file.is_some() {
            ImageSource::Compose
        } else {
            ImageSource::None
        }
    }

    /// Remote user with container user fallback
    pub fn effective_user(&self) -> Option<&str> {
        self.remote_user
            .as_deref()
            .or(self.container_user.as_deref())
    }

    /// All forwarded ports as a flat list
    pub fn forward_ports_list(&self) -> Vec<u16> {
        let mut ports = Vec::new();

        if let Some(ref forward) = self.forward_ports {
            for mapping in forward {
                match mapping {
                    PortMapping::Number(p) => ports.push(*p),
                    PortMapping::Object(obj) => ports.push(obj.port),
                }
            }
        }

        if let Some(ref app) = self.app_port {
            match app {
                IntOrArray::Int(p) => ports.push(*p),
                IntOrArray::Array(arr) => ports.extend(arr),
            }
        }

        ports.dedup();
        ports
    }
}

/// Strip `//` and `/* */` comments outside of strings
fn strip_json_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek().copied()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                while let Some(&nc) = chars.peek() {
                    if nc == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> DevContainerConfig {
        DevContainerConfig::parse(json, Path::new("devcontainer.json")).unwrap()
    }

    #[test]
    fn test_parse_simple_image() {
        let config = parse(r#"{"image": "mcr.microsoft.com/devcontainers/rust:1"}"#);
        assert_eq!(
            config.image_source(),
            ImageSource::Image("mcr.microsoft.com/devcontainers/rust:1".to_string())
        );
    }

    #[test]
    fn test_parse_with_build() {
        let config = parse(
            r#"{
            "build": {
                "dockerfile": "Dockerfile",
                "context": "..",
                "args": { "VARIANT": "3.11" }
            }
        }"#,
        );
        match config.image_source() {
            ImageSource::Dockerfile {
                path,
                context,
                args,
                ..
            } => {
                assert_eq!(path, "Dockerfile");
                assert_eq!(context.as_deref(), Some(".."));
                assert_eq!(args.get("VARIANT").map(String::as_str), Some("3.11"));
            }
            other => panic!("unexpected source: {:?}", other),
        }
    }

    #[test]
    fn test_compose_and_empty_sources() {
        assert_eq!(
            parse(r#"{"dockerComposeFile": "compose.yml"}"#).image_source(),
            ImageSource::Compose
        );
        assert_eq!(parse("{}").image_source(), ImageSource::None);
    }

    #[test]
    fn test_strip_comments() {
        let config = parse(
            r#"{
            // This is a comment
            "name": "test", /* inline comment */
            "image": "ubuntu" // trailing
        }"#,
        );
        assert_eq!(config.name, Some("test".to_string()));
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let config = parse(r#"{"image": "registry.local//img", "remoteUser": "a\"/*b"}"#);
        assert_eq!(config.image.as_deref(), Some("registry.local//img"));
        assert_eq!(config.remote_user.as_deref(), Some("a\"/*b"));
    }

    #[test]
    fn test_command_string() {
        let config = parse(r#"{"postCreateCommand": "npm install"}"#);
        let cmds = config.post_create_command.unwrap().to_shell_commands();
        assert_eq!(cmds, vec!["npm install"]);
    }

    #[test]
    fn test_command_array_is_one_line() {
        let config = parse(r#"{"postCreateCommand": ["echo", "hello world"]}"#);
        let cmds = config.post_create_command.unwrap().to_shell_commands();
        assert_eq!(cmds, vec!["echo 'hello world'"]);
    }

    #[test]
    fn test_command_object_in_key_order() {
        let config = parse(
            r#"{"postStartCommand": {"server": "npm start", "db": ["pg_ctl", "start"]}}"#,
        );
        let cmds = config.post_start_command.unwrap().to_shell_commands();
        assert_eq!(cmds, vec!["pg_ctl start", "npm start"]);
    }

    #[test]
    fn test_empty_command_is_dropped() {
        let config = parse(r#"{"postCreateCommand": "  "}"#);
        assert!(config
            .post_create_command
            .unwrap()
            .to_shell_commands()
            .is_empty());
    }

    #[test]
    fn test_shell_join_quotes_single_quotes() {
        let argv = vec!["echo".to_string(), "it's".to_string(), String::new()];
        assert_eq!(shell_join(&argv), r"echo 'it'\''s' ''");
    }

    #[test]
    fn test_mount_object_to_string() {
        let config = parse(
            r#"{"mounts": [
                "type=volume,source=cache,target=/cache",
                {"type": "bind", "source": "/data", "target": "/data", "readOnly": true}
            ]}"#,
        );
        let mounts: Vec<String> = config
            .mounts
            .unwrap()
            .iter()
            .map(Mount::to_mount_string)
            .collect();
        assert_eq!(
            mounts,
            vec![
                "type=volume,source=cache,target=/cache",
                "type=bind,source=/data,target=/data,readonly"
            ]
        );
    }

    #[test]
    fn test_forward_ports_list() {
        let config = parse(
            r#"{"forwardPorts": [3000, {"port": 5432, "label": "db"}], "appPort": [8080]}"#,
        );
        assert_eq!(config.forward_ports_list(), vec![3000, 5432, 8080]);
    }

    #[test]
    fn test_effective_user_fallback() {
        let config = parse(r#"{"containerUser": "vscode"}"#);
        assert_eq!(config.effective_user(), Some("vscode"));
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let config = parse(r#"{"image": "ubuntu", "features": {"git": {}}}"#);
        assert!(config.extra.contains_key("features"));
    }

    #[test]
    fn test_find_in_dir_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".devcontainer.json"), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join(".devcontainer")).unwrap();
        std::fs::write(
            dir.path().join(".devcontainer/devcontainer.json"),
            r#"{"image": "ubuntu"}"#,
        )
        .unwrap();

        let (config, path) = DevContainerConfig::load_from_dir(dir.path()).unwrap();
        assert!(path.ends_with(".devcontainer/devcontainer.json"));
        assert_eq!(config.image.as_deref(), Some("ubuntu"));
    }

    #[test]
    fn test_load_from_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = DevContainerConfig::load_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let err = DevContainerConfig::parse("{ not json", Path::new("/p/devcontainer.json"))
            .unwrap_err();
        match err {
            ConfigError::JsonParseError { path, .. } => {
                assert_eq!(path, PathBuf::from("/p/devcontainer.json"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

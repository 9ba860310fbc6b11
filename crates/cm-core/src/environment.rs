//! Environment entity and lifecycle state machine

use crate::{CoreError, ErrorCode, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::LazyLock;

pub const NAME_MAX_LEN: usize = 64;

/// Prefix of every generated environment ID
pub const ENV_ID_PREFIX: &str = "env-";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").expect("environment name pattern is valid")
});

/// Environment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Record exists, container not yet provisioned
    Creating,
    Running,
    Stopped,
    Paused,
    /// Provisioning or start failed; see `status_msg`
    Error,
    /// The recorded container no longer exists in the runtime
    Orphaned,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "orphaned" => Ok(Self::Orphaned),
            _ => Err(format!("Unknown environment status: {}", s)),
        }
    }
}

/// A named, isolated development environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub project_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Forwarded ports, "<container port>/<proto>" -> host port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,

    /// IDs of environments this one is linked to
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub linked_envs: BTreeSet<String>,

    /// Specific GPU device IDs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// Memory limit, e.g. "8g"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// CPU limit in cores, e.g. 1.5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,

    pub status: EnvironmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    /// Runtime backing the environment ("docker" or "podman")
    #[serde(default)]
    pub backend: String,
}

impl Environment {
    /// New record in `Creating` state with a fresh ID
    pub fn new(name: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            name: name.into(),
            template: None,
            project_dir: project_dir.into(),
            config_file: None,
            container_id: None,
            container_name: None,
            image_tag: None,
            network_id: None,
            network_name: None,
            ports: BTreeMap::new(),
            linked_envs: BTreeSet::new(),
            gpus: Vec::new(),
            gpu_count: None,
            memory_limit: None,
            cpu_limit: None,
            status: EnvironmentStatus::Creating,
            status_msg: None,
            labels: BTreeMap::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
            backend: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == EnvironmentStatus::Running
    }

    /// Move to `status`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, status: EnvironmentStatus, msg: Option<String>) -> Result<()> {
        if !can_transition(self.status, status) {
            return Err(CoreError::new(
                ErrorCode::InvalidConfig,
                format!("cannot move from {} to {}", self.status, status),
            )
            .with_env(&self.id, &self.name));
        }
        self.status = status;
        self.status_msg = msg;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure, keeping the environment for cleanup or retry
    pub fn fail(&mut self, msg: impl Into<String>) {
        self.status = EnvironmentStatus::Error;
        self.status_msg = Some(msg.into());
        self.updated_at = Utc::now();
    }

    /// Short container ID for display
    pub fn short_container_id(&self) -> &str {
        match self.container_id.as_deref() {
            Some(id) => id.get(..12).unwrap_or(id),
            None => "",
        }
    }
}

/// Check an environment name
///
/// Names are docker-compatible: a letter, then letters, digits, `_`, `.`
/// or `-`, at most [`NAME_MAX_LEN`] characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_name(name, "environment name cannot be empty"));
    }
    if name.chars().count() > NAME_MAX_LEN {
        return Err(CoreError::invalid_name(
            name,
            format!("environment name must be at most {} characters", NAME_MAX_LEN),
        ));
    }
    if !NAME_RE.is_match(name) {
        return Err(CoreError::invalid_name(
            name,
            "environment name must start with a letter and contain only letters, digits, '_', '.' or '-'",
        ));
    }
    Ok(())
}

/// `env-` followed by 8 random bytes in hex
pub fn generate_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("{}{}", ENV_ID_PREFIX, hex::encode(bytes))
}

/// Whether the lifecycle allows moving from `from` to `to`
///
/// Reconciliation may move any settled state to `Orphaned`, and a failure
/// may land anywhere in `Error`.
pub fn can_transition(from: EnvironmentStatus, to: EnvironmentStatus) -> bool {
    use EnvironmentStatus::*;
    if from == to || to == Error {
        return true;
    }
    matches!(
        (from, to),
        (Creating, Running)
            | (Creating, Stopped)
            | (Running, Stopped)
            | (Running, Paused)
            | (Paused, Running)
            | (Paused, Stopped)
            | (Stopped, Running)
            | (Error, Running)
            | (Error, Stopped)
            | (Orphaned, Running)
            | (Running, Orphaned)
            | (Stopped, Orphaned)
            | (Paused, Orphaned)
            | (Error, Orphaned)
    )
}

/// What the runtime reports for an environment's container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    /// No container, or the runtime no longer knows it
    Missing,
    Running,
    Paused,
    /// Any other state: created, exited, dead...
    Other,
}

impl From<cm_provider::ContainerStatus> for LiveState {
    fn from(status: cm_provider::ContainerStatus) -> Self {
        use cm_provider::ContainerStatus;
        match status {
            ContainerStatus::Running => Self::Running,
            ContainerStatus::Paused => Self::Paused,
            _ => Self::Other,
        }
    }
}

/// Outcome of reconciling a stored status against the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub status: EnvironmentStatus,
    /// The stored container handle must be dropped
    pub clear_container: bool,
}

/// Reconcile a stored status with what the runtime observed
///
/// `has_container` says whether the record holds a container ID at all.
/// Environments without one (never provisioned) keep their stored status.
pub fn reconcile_status(
    stored: EnvironmentStatus,
    has_container: bool,
    live: LiveState,
) -> Reconciled {
    let keep = Reconciled {
        status: stored,
        clear_container: false,
    };

    if !has_container {
        return keep;
    }

    match live {
        LiveState::Missing if stored == EnvironmentStatus::Creating => keep,
        LiveState::Missing => Reconciled {
            status: EnvironmentStatus::Orphaned,
            clear_container: true,
        },
        LiveState::Running => Reconciled {
            status: EnvironmentStatus::Running,
            clear_container: false,
        },
        LiveState::Paused => Reconciled {
            status: EnvironmentStatus::Paused,
            clear_container: false,
        },
        // Created, exited or dead
        LiveState::Other => Reconciled {
            status: EnvironmentStatus::Stopped,
            clear_container: false,
        },
    }
}

/// Parse a memory limit such as `512m`, `8g`, `1024k` or plain bytes
pub fn parse_memory(limit: &str) -> Result<i64> {
    let s = limit.trim().to_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('k') => (&s[..s.len() - 1], 1024),
        _ => (s, 1),
    };

    digits
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(|| CoreError::invalid_config(format!("invalid memory limit: {:?}", limit)))
}

/// CPU cores to the runtime's nano-CPU units
pub fn cpu_to_nano(cpus: f64) -> Result<i64> {
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(CoreError::invalid_config(format!(
            "invalid CPU limit: {}",
            cpus
        )));
    }
    Ok((cpus * 1e9) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentStatus::*;

    #[test]
    fn test_validate_name_accepts_docker_names() {
        for name in ["a", "web", "Api-2", "my_env.v1", "x-_.", &"a".repeat(64)] {
            assert!(validate_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_validate_name_rejects_bad_names() {
        for name in ["", "1web", "-web", "_web", ".web", "we b", "web/1", "wéb", &"a".repeat(65)] {
            let err = validate_name(name).unwrap_err();
            assert!(err.is(ErrorCode::InvalidName), "{} should be invalid", name);
        }
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id();
        assert!(id.starts_with(ENV_ID_PREFIX));
        assert_eq!(id.len(), ENV_ID_PREFIX.len() + 16);
        assert!(id[ENV_ID_PREFIX.len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_new_environment_is_creating() {
        let env = Environment::new("web", "/src/web");
        assert_eq!(env.status, Creating);
        assert_eq!(env.created_at, env.updated_at);
        assert!(env.container_id.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(can_transition(Creating, Running));
        assert!(can_transition(Creating, Stopped));
        assert!(can_transition(Running, Stopped));
        assert!(can_transition(Stopped, Running));
        assert!(can_transition(Orphaned, Running));
        assert!(can_transition(Running, Orphaned));
        assert!(can_transition(Stopped, Error));

        assert!(!can_transition(Stopped, Creating));
        assert!(!can_transition(Orphaned, Stopped));
        assert!(!can_transition(Creating, Orphaned));
    }

    #[test]
    fn test_transition_updates_record() {
        let mut env = Environment::new("web", "/src/web");
        env.transition(Running, None).unwrap();
        assert!(env.is_running());

        let err = env.transition(Creating, None).unwrap_err();
        assert!(err.to_string().contains("cannot move from running to creating"));
        assert!(env.is_running());
    }

    #[test]
    fn test_fail_keeps_message() {
        let mut env = Environment::new("web", "/src/web");
        env.fail("image pull failed");
        assert_eq!(env.status, Error);
        assert_eq!(env.status_msg.as_deref(), Some("image pull failed"));
    }

    #[test]
    fn test_short_container_id() {
        let mut env = Environment::new("web", "/src/web");
        assert_eq!(env.short_container_id(), "");

        env.container_id = Some("0123456789abcdef".into());
        assert_eq!(env.short_container_id(), "0123456789ab");

        env.container_id = Some("abc".into());
        assert_eq!(env.short_container_id(), "abc");

        // 12 bytes falls inside a multi-byte character
        env.container_id = Some("aéééééé".into());
        assert_eq!(env.short_container_id(), "aéééééé");
    }

    #[test]
    fn test_reconcile_missing_container_orphans() {
        for stored in [Running, Stopped, Paused, Error] {
            let r = reconcile_status(stored, true, LiveState::Missing);
            assert_eq!(r.status, Orphaned);
            assert!(r.clear_container);
        }
    }

    #[test]
    fn test_reconcile_live_states() {
        assert_eq!(reconcile_status(Stopped, true, LiveState::Running).status, Running);
        assert_eq!(reconcile_status(Running, true, LiveState::Paused).status, Paused);
        assert_eq!(reconcile_status(Running, true, LiveState::Other).status, Stopped);
        assert_eq!(reconcile_status(Orphaned, true, LiveState::Running).status, Running);
    }

    #[test]
    fn test_reconcile_recovers_error_with_stopped_container() {
        let r = reconcile_status(Error, true, LiveState::Other);
        assert_eq!(r.status, Stopped);
        assert!(!r.clear_container);
        assert_eq!(reconcile_status(Error, true, LiveState::Running).status, Running);
    }

    #[test]
    fn test_reconcile_without_container_keeps_status() {
        for stored in [Creating, Stopped, Error, Orphaned] {
            let r = reconcile_status(stored, false, LiveState::Missing);
            assert_eq!(r.status, stored);
            assert!(!r.clear_container);
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("8G").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("-1g").is_err());
    }

    #[test]
    fn test_cpu_to_nano() {
        assert_eq!(cpu_to_nano(1.5).unwrap(), 1_500_000_000);
        assert!(cpu_to_nano(0.0).is_err());
        assert!(cpu_to_nano(f64::NAN).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!("Orphaned".parse::<EnvironmentStatus>().unwrap(), Orphaned);
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"running\"");
        assert!("gone".parse::<EnvironmentStatus>().is_err());
    }

    #[test]
    fn test_serialized_field_names() {
        let mut env = Environment::new("web", "/src/web");
        env.linked_envs.insert("env-00".into());
        let json = serde_json::to_value(&env).unwrap();
        for key in ["id", "name", "project_dir", "status", "created_at", "updated_at", "linked_envs"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert!(json.get("container_id").is_none());
    }
}

//! Error types for cm-core
//!
//! Every failure carries a stable [`ErrorCode`] so callers can branch on the
//! kind of failure without parsing messages, plus optional environment
//! context and a suggestion shown to users.

use cm_config::ConfigError;
use cm_provider::ProviderError;
use thiserror::Error;

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    EnvNotFound,
    EnvExists,
    EnvRunning,
    EnvStopped,
    ContainerNotFound,
    ImageNotFound,
    NetworkNotFound,
    NetworkInUse,
    InvalidName,
    InvalidConfig,
    RuntimeUnavailable,
    RuntimeError,
    GpuUnavailable,
    InsufficientResources,
    LinkExists,
    LinkNotFound,
    SelfLink,
    StateCorrupted,
    OperationTimeout,
    Io,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvNotFound => "ENV_NOT_FOUND",
            Self::EnvExists => "ENV_EXISTS",
            Self::EnvRunning => "ENV_RUNNING",
            Self::EnvStopped => "ENV_STOPPED",
            Self::ContainerNotFound => "CONTAINER_NOT_FOUND",
            Self::ImageNotFound => "IMAGE_NOT_FOUND",
            Self::NetworkNotFound => "NETWORK_NOT_FOUND",
            Self::NetworkInUse => "NETWORK_IN_USE",
            Self::InvalidName => "INVALID_NAME",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::RuntimeUnavailable => "DOCKER_UNAVAILABLE",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::GpuUnavailable => "GPU_UNAVAILABLE",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::LinkExists => "LINK_EXISTS",
            Self::LinkNotFound => "LINK_NOT_FOUND",
            Self::SelfLink => "SELF_LINK",
            Self::StateCorrupted => "STATE_CORRUPTED",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::Io => "IO_ERROR",
        }
    }

    /// Suggestion shown when the error carries none of its own
    pub fn default_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::EnvNotFound => Some("Run 'cm env list' to see available environments"),
            Self::EnvExists => Some(
                "Use 'cm env delete <name>' to remove the existing environment, or use --force",
            ),
            Self::EnvStopped => Some("Start it first with 'cm env start <name>'"),
            Self::RuntimeUnavailable => {
                Some("Check that Docker or Podman is running and its socket is reachable")
            }
            Self::GpuUnavailable => Some("Check the NVIDIA container toolkit with 'nvidia-smi'"),
            Self::InsufficientResources => Some(
                "Stop other environments with 'cm env stop' or reduce resource requests",
            ),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("[{code}] {}", qualified(.env_name, .env_id, .message))]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub env_id: Option<String>,
    pub env_name: Option<String>,
    pub suggestion: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

fn qualified(env_name: &Option<String>, env_id: &Option<String>, message: &str) -> String {
    match env_name.as_ref().or(env_id.as_ref()) {
        Some(env) => format!("{}: {}", env, message),
        None => message.to_string(),
    }
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            env_id: None,
            env_name: None,
            suggestion: None,
            source: None,
        }
    }

    /// Attach the environment this error concerns
    pub fn with_env(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        let (id, name) = (id.into(), name.into());
        self.env_id = (!id.is_empty()).then_some(id);
        self.env_name = (!name.is_empty()).then_some(name);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Message followed by every underlying cause, for recording in
    /// `status_msg`
    pub fn cause_chain(&self) -> String {
        let mut out = self.message.clone();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    pub fn env_not_found(name_or_id: &str) -> Self {
        Self::new(ErrorCode::EnvNotFound, "environment not found").with_env("", name_or_id)
    }

    pub fn env_exists(name: &str) -> Self {
        Self::new(ErrorCode::EnvExists, "environment already exists").with_env("", name)
    }

    pub fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidName, reason).with_env("", name)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
    }

    pub fn network_not_found(network: &str) -> Self {
        Self::new(
            ErrorCode::NetworkNotFound,
            format!("network {} not found", network),
        )
    }
}

impl From<ProviderError> for CoreError {
    fn from(err: ProviderError) -> Self {
        let (code, message) = match &err {
            ProviderError::ConnectionError(_) => {
                (ErrorCode::RuntimeUnavailable, "container runtime is not available")
            }
            ProviderError::ContainerNotFound(_) => (ErrorCode::ContainerNotFound, "container not found"),
            ProviderError::ImageNotFound(_) => (ErrorCode::ImageNotFound, "image not found"),
            ProviderError::NetworkNotFound(_) => (ErrorCode::NetworkNotFound, "network not found"),
            ProviderError::ConfigError(_) => (ErrorCode::InvalidConfig, "invalid container configuration"),
            _ => (ErrorCode::RuntimeError, "container runtime error"),
        };
        Self::new(code, message).with_source(err)
    }
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        let not_found = matches!(err, ConfigError::NotFound(_));
        let core = Self::new(ErrorCode::InvalidConfig, "invalid configuration").with_source(err);
        if not_found {
            core.with_suggestion(
                "No devcontainer.json found. Create one or specify a template with --template",
            )
        } else {
            core
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, "I/O error").with_source(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::StateCorrupted, "environment state is corrupted").with_source(err)
    }
}

/// Multi-line rendering for terminals, with a suggestion when one applies
pub fn format_user_error(err: &CoreError) -> String {
    let mut out = format!("Error: {}\n", err.message);

    if let Some(ref name) = err.env_name {
        out.push_str(&format!("Environment: {}\n", name));
    }

    if let Some(ref source) = err.source {
        out.push_str(&format!("Details: {}\n", source));
    }

    let suggestion = err
        .suggestion
        .as_deref()
        .or_else(|| err.code.default_suggestion());
    if let Some(suggestion) = suggestion {
        out.push_str(&format!("\nSuggestion: {}\n", suggestion));
    }

    out
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_includes_code_and_env() {
        let err = CoreError::env_not_found("web");
        assert_eq!(err.to_string(), "[ENV_NOT_FOUND] web: environment not found");

        let err = CoreError::new(ErrorCode::SelfLink, "cannot link environment to itself")
            .with_env("env-0011223344556677", "");
        assert_eq!(
            err.to_string(),
            "[SELF_LINK] env-0011223344556677: cannot link environment to itself"
        );

        let err = CoreError::new(ErrorCode::StateCorrupted, "bad ledger");
        assert_eq!(err.to_string(), "[STATE_CORRUPTED] bad ledger");
    }

    #[test]
    fn test_provider_errors_map_to_codes() {
        let err: CoreError = ProviderError::ConnectionError("refused".into()).into();
        assert!(err.is(ErrorCode::RuntimeUnavailable));
        assert!(err.source().is_some());

        let err: CoreError = ProviderError::NetworkNotFound("cm-x".into()).into();
        assert!(err.is(ErrorCode::NetworkNotFound));

        let err: CoreError = ProviderError::Conflict("in use".into()).into();
        assert!(err.is(ErrorCode::RuntimeError));
    }

    #[test]
    fn test_cause_chain_keeps_runtime_detail() {
        let err: CoreError =
            ProviderError::RuntimeError("registry unreachable: dial tcp timeout".into()).into();
        let chain = err.cause_chain();
        assert!(chain.starts_with("container runtime error: "));
        assert!(chain.contains("registry unreachable: dial tcp timeout"));

        let err = CoreError::new(ErrorCode::EnvRunning, "environment is running");
        assert_eq!(err.cause_chain(), "environment is running");
    }

    #[test]
    fn test_config_not_found_carries_suggestion() {
        let err: CoreError = ConfigError::NotFound("/src/app".into()).into();
        assert!(err.is(ErrorCode::InvalidConfig));
        assert!(err.suggestion.unwrap().contains("--template"));
    }

    #[test]
    fn test_format_user_error_default_suggestion() {
        let out = format_user_error(&CoreError::env_not_found("web"));
        assert!(out.starts_with("Error: environment not found\n"));
        assert!(out.contains("Environment: web\n"));
        assert!(out.contains("Suggestion: Run 'cm env list'"));
    }

    #[test]
    fn test_format_user_error_explicit_suggestion_wins() {
        let err = CoreError::env_not_found("")
            .with_suggestion("No active environment. Use 'cm env switch <name>' to set one");
        let out = format_user_error(&err);
        assert!(out.contains("No active environment"));
        assert!(!out.contains("cm env list"));
        assert!(!out.contains("Environment:"));
    }

    #[test]
    fn test_format_user_error_includes_details() {
        let err: CoreError = ProviderError::ContainerNotFound("abc".into()).into();
        let out = format_user_error(&err);
        assert!(out.contains("Details: Container not found: abc"));
        assert!(!out.contains("Suggestion"));
    }
}

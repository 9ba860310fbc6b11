//! Error types for container providers

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    /// Name already taken, endpoint already attached, or object in use
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Exec failed: {0}")]
    ExecError(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProviderError {
    /// Any of the not-found variants
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) | Self::NetworkNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<bollard::errors::Error> for ProviderError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::ContainerNotFound(message),
            Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::Conflict(message),
            Error::DockerResponseServerError { message, .. }
                if message.contains("already exists") =>
            {
                Self::Conflict(message)
            }
            Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::RuntimeError(format!("{} (status {})", message, status_code)),
            Error::IOError { err } => Self::IoError(err),
            Error::HyperResponseError { .. } | Error::RequestTimeoutError => {
                Self::ConnectionError(err.to_string())
            }
            other => Self::RuntimeError(other.to_string()),
        }
    }
}

/// Map a bollard error from a network endpoint, where 404 means the
/// network (or the container named in the request) is missing
pub(crate) fn network_err(err: bollard::errors::Error, network: &str) -> ProviderError {
    match ProviderError::from(err) {
        ProviderError::ContainerNotFound(message) => {
            if message.to_lowercase().contains("container") {
                ProviderError::ContainerNotFound(message)
            } else {
                ProviderError::NetworkNotFound(format!("{}: {}", network, message))
            }
        }
        other => other,
    }
}

/// Map a bollard error from an image endpoint
pub(crate) fn image_err(err: bollard::errors::Error, image: &str) -> ProviderError {
    match ProviderError::from(err) {
        ProviderError::ContainerNotFound(message) => {
            ProviderError::ImageNotFound(format!("{}: {}", image, message))
        }
        other => other,
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file: {0}")]
    Write(#[source] std::io::Error),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Errors raised by the dependency container
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("No dependency registered for {0}")]
    NotFound(&'static str),
}

/// Error returned by a module from its initialize entry point
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Missing dependency: {0}")]
    Dependency(#[from] ContainerError),

    #[error("Module initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ModuleError {
    pub fn init(message: impl Into<String>) -> Self {
        ModuleError::Initialization(message.into())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

use forge_core::ContainerError;
use forge_ipc::IpcError;
use thiserror::Error;

/// Errors that abort a module load before any module is initialized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Module '{module}' depends on '{dependency}', which was not found")]
    MissingDependency { module: String, dependency: String },

    #[error("Circular dependency detected involving module '{module}'")]
    CircularDependency { module: String },
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Module load failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("Dependency error: {0}")]
    Container(#[from] ContainerError),
}

pub type HostResult<T> = Result<T, HostError>;

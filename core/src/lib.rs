// Core building blocks shared by every Forge crate:
// - Configuration loading
// - Shared error types
// - Logging initialisation
// - Shutdown signalling
// - Dependency container and the module contract

// Export config module - Configuration loading
pub mod config;
pub use config::*;

// Export errors module - Shared error types
pub mod errors;
pub use errors::*;

pub mod logging;

pub mod shutdown;
pub use shutdown::{Shutdown, ShutdownListener};

// Dependency injection container shared by all modules
pub mod container;
pub use container::Container;

// Plugin contract consumed by the loader
pub mod module;
pub use module::{Module, ModuleState, ModuleStatus};

// Module host runtime:
// - Plugin catalog and manifest scan
// - Dependency-ordered module loader
// - Command dispatcher on the host endpoint
// - Host lifecycle used by forge-hostd

pub mod builtin; // Modules shipped with the host
pub mod commands;
pub mod errors;
pub mod host;
pub mod loader;
pub mod plugins;

pub use commands::{CommandDispatcher, HostCommand};
pub use errors::{HostError, HostResult, LoaderError};
pub use host::Host;
pub use loader::{LoadReport, ModuleInfo, ModuleLoader};
pub use plugins::{scan_directory, PluginCatalog, PluginEntry, PluginManifest};

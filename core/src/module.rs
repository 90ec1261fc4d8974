use crate::container::Container;
use crate::errors::ModuleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a loaded module.
///
/// `NotStarted -> Starting -> Running`, or `-> Error` when initialization fails;
/// `Running -> Stopping -> Stopped` on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModuleStatus {
    NotStarted = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Error = 5,
}

impl ModuleStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ModuleStatus::NotStarted,
            1 => ModuleStatus::Starting,
            2 => ModuleStatus::Running,
            3 => ModuleStatus::Stopping,
            4 => ModuleStatus::Stopped,
            _ => ModuleStatus::Error,
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::NotStarted => "not started",
            ModuleStatus::Starting => "starting",
            ModuleStatus::Running => "running",
            ModuleStatus::Stopping => "stopping",
            ModuleStatus::Stopped => "stopped",
            ModuleStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Status cell embedded by every module. Written by the loader and by the module's own `stop`.
#[derive(Debug)]
pub struct ModuleState {
    status: AtomicU8,
}

impl ModuleState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ModuleStatus::NotStarted as u8),
        }
    }

    pub fn get(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ModuleStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl Default for ModuleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract every loadable unit implements.
///
/// `name` doubles as the module's IPC endpoint name and must be unique within a host.
/// The loader calls `initialize` exactly once per successful load and `stop` at most once.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Names of modules that must be initialized before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn state(&self) -> &ModuleState;

    fn status(&self) -> ModuleStatus {
        self.state().get()
    }

    /// Wire the module up. Publish capabilities with `container.register`, look up other
    /// modules' capabilities with `container.get`/`try_resolve`.
    async fn initialize(&self, container: Arc<Container>) -> Result<(), ModuleError>;

    /// Release resources. Implementations move their state through `Stopping` to `Stopped`.
    async fn stop(&self);
}

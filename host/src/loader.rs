use crate::errors::LoaderError;
use forge_core::{Container, Module, ModuleStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Outcome of a load: module names by result, in initialization order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
    /// Candidates dropped because an earlier one had the same name
    pub duplicates: Vec<String>,
}

/// Snapshot of one loaded module, as reported by the `modules` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub status: ModuleStatus,
}

/// Keeps the first candidate of each name.
pub fn dedupe(candidates: Vec<Arc<dyn Module>>) -> (Vec<Arc<dyn Module>>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = Vec::new();
    for module in candidates {
        if seen.insert(module.name().to_string()) {
            unique.push(module);
        } else {
            warn!(module = module.name(), "Duplicate module name, keeping the first one");
            duplicates.push(module.name().to_string());
        }
    }
    (unique, duplicates)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Orders modules so every module comes after its dependencies. Names must be unique.
pub fn resolve_order(modules: &[Arc<dyn Module>]) -> Result<Vec<Arc<dyn Module>>, LoaderError> {
    let by_name: HashMap<&str, &Arc<dyn Module>> =
        modules.iter().map(|m| (m.name(), m)).collect();
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut ordered = Vec::with_capacity(modules.len());

    fn visit(
        module: &Arc<dyn Module>,
        by_name: &HashMap<&str, &Arc<dyn Module>>,
        marks: &mut HashMap<String, Mark>,
        ordered: &mut Vec<Arc<dyn Module>>,
    ) -> Result<(), LoaderError> {
        match marks.get(module.name()) {
            Some(Mark::Visited) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(LoaderError::CircularDependency {
                    module: module.name().to_string(),
                })
            }
            None => {}
        }
        marks.insert(module.name().to_string(), Mark::Visiting);

        for dependency in module.dependencies() {
            let Some(dep) = by_name.get(dependency.as_str()) else {
                return Err(LoaderError::MissingDependency {
                    module: module.name().to_string(),
                    dependency,
                });
            };
            visit(dep, by_name, marks, ordered)?;
        }

        marks.insert(module.name().to_string(), Mark::Visited);
        ordered.push(Arc::clone(module));
        Ok(())
    }

    for module in modules {
        visit(module, &by_name, &mut marks, &mut ordered)?;
    }
    Ok(ordered)
}

/// Initializes modules in dependency order and stops them in reverse.
pub struct ModuleLoader {
    container: Arc<Container>,
    loaded: RwLock<Vec<Arc<dyn Module>>>,
}

impl ModuleLoader {
    pub fn new(container: Arc<Container>) -> Self {
        Self {
            container,
            loaded: RwLock::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Module>> {
        self.loaded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Dedupes and orders `candidates`, then initializes each one. A failing or panicking
    /// module is marked `Error` and the rest still load. Ordering errors abort before any
    /// module is touched. Modules loaded by an earlier call count as dependencies but are
    /// never initialized again.
    pub async fn load(&self, candidates: Vec<Arc<dyn Module>>) -> Result<LoadReport, LoaderError> {
        let previous = self.snapshot();
        let (unique, mut duplicates) = dedupe(candidates);
        let (unique, reloaded): (Vec<_>, Vec<_>) = unique
            .into_iter()
            .partition(|m| !previous.iter().any(|p| p.name() == m.name()));
        for module in &reloaded {
            warn!(module = module.name(), "Module already loaded, skipping");
            duplicates.push(module.name().to_string());
        }

        let new_names: HashSet<&str> = unique.iter().map(|m| m.name()).collect();
        let mut graph = previous.clone();
        graph.extend(unique.iter().cloned());
        let ordered: Vec<Arc<dyn Module>> = resolve_order(&graph)?
            .into_iter()
            .filter(|m| new_names.contains(m.name()))
            .collect();
        info!(count = ordered.len(), "Loading modules");

        self.loaded
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(ordered.iter().cloned());

        let by_name: HashMap<String, Arc<dyn Module>> = graph
            .iter()
            .map(|m| (m.name().to_string(), Arc::clone(m)))
            .collect();

        let mut report = LoadReport {
            duplicates,
            ..LoadReport::default()
        };

        for module in ordered {
            for dependency in module.dependencies() {
                let status = by_name.get(&dependency).map(|d| d.status());
                if status != Some(ModuleStatus::Running) {
                    warn!(
                        module = module.name(),
                        dependency = %dependency,
                        status = ?status,
                        "Dependency is not running, initializing anyway"
                    );
                }
            }

            module.state().set(ModuleStatus::Starting);
            debug!(module = module.name(), version = module.version(), "Initializing module");

            let mut outcome = self.initialize(&module).await;
            // A module that put itself back to NotStarted was not ready yet; give it one retry.
            if outcome.is_ok() && module.status() == ModuleStatus::NotStarted {
                warn!(module = module.name(), "Module still not started, retrying initialization once");
                module.state().set(ModuleStatus::Starting);
                outcome = self.initialize(&module).await;
            }

            match outcome {
                Ok(()) => {
                    module.state().set(ModuleStatus::Running);
                    info!(module = module.name(), version = module.version(), "Module running");
                    report.started.push(module.name().to_string());
                }
                Err(reason) => {
                    module.state().set(ModuleStatus::Error);
                    error!(module = module.name(), error = %reason, "Module failed to initialize");
                    report.failed.push(module.name().to_string());
                }
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            duplicates = report.duplicates.len(),
            "Module load complete"
        );
        Ok(report)
    }

    /// Runs `initialize` on its own task so a panic is reported instead of unwinding the loader.
    async fn initialize(&self, module: &Arc<dyn Module>) -> Result<(), String> {
        let task_module = Arc::clone(module);
        let container = Arc::clone(&self.container);
        match tokio::spawn(async move { task_module.initialize(container).await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("panicked during initialization: {e}")),
        }
    }

    /// Stops every running module once, last initialized first.
    pub async fn stop_all(&self) {
        for module in self.snapshot().into_iter().rev() {
            if module.status() != ModuleStatus::Running {
                continue;
            }
            module.state().set(ModuleStatus::Stopping);
            let name = module.name().to_string();
            let task_module = Arc::clone(&module);
            if let Err(e) = tokio::spawn(async move { task_module.stop().await }).await {
                error!(module = %name, error = %e, "Module panicked while stopping");
            }
            module.state().set(ModuleStatus::Stopped);
            debug!(module = %name, "Module stopped");
        }
    }

    pub fn statuses(&self) -> Vec<ModuleInfo> {
        self.snapshot()
            .iter()
            .map(|m| ModuleInfo {
                name: m.name().to_string(),
                version: m.version().to_string(),
                status: m.status(),
            })
            .collect()
    }

    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.snapshot()
    }
}

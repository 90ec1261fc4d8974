use crate::commands::CommandDispatcher;
use crate::errors::HostResult;
use crate::loader::{LoadReport, ModuleLoader};
use crate::plugins::PluginCatalog;
use forge_core::{Container, HostConfig, Shutdown};
use forge_ipc::{DiscoveryConfig, DiscoveryService, IpcClient, IpcOptions};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A running module host.
pub struct Host {
    config: HostConfig,
    container: Arc<Container>,
    client: IpcClient,
    discovery: Option<Arc<DiscoveryService>>,
    loader: Arc<ModuleLoader>,
    shutdown: Shutdown,
    report: LoadReport,
}

impl Host {
    /// Starts a host with the built-in plugin packages.
    pub async fn start(config: HostConfig) -> HostResult<Self> {
        Self::start_with_catalog(config, PluginCatalog::with_builtins()).await
    }

    /// Opens the host endpoint, starts discovery, publishes the shared services in the
    /// container and loads every module enabled in the module directory.
    pub async fn start_with_catalog(config: HostConfig, catalog: PluginCatalog) -> HostResult<Self> {
        info!(host = %config.host_name, "Starting module host");
        let container = Arc::new(Container::new());
        let shutdown = Shutdown::new();
        let client = IpcClient::new(IpcOptions::from(&config));

        container.register(Arc::new(config.clone()));
        container.register(Arc::new(client.clone()));
        container.register(Arc::new(shutdown.clone()));

        let discovery = if config.discovery.enabled {
            let discovery_config = DiscoveryConfig::from_host_config(&config)?;
            let service = Arc::new(DiscoveryService::start(client.clone(), discovery_config).await?);
            container.register(Arc::clone(&service));
            Some(service)
        } else {
            info!("Discovery disabled");
            None
        };

        let loader = Arc::new(ModuleLoader::new(Arc::clone(&container)));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.host_name.clone(),
            client.clone(),
            Arc::clone(&loader),
            discovery.clone(),
            shutdown.clone(),
        ));
        dispatcher.install()?;

        let candidates = catalog.discover(&config.module_directory);
        let report = match loader.load(candidates).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Module load aborted");
                if let Some(discovery) = &discovery {
                    discovery.dispose().await;
                }
                client.shutdown_all();
                return Err(e.into());
            }
        };
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some modules failed to start");
        }

        info!(
            host = %config.host_name,
            modules = report.started.len(),
            "Module host running"
        );
        Ok(Self {
            config,
            container,
            client,
            discovery,
            loader,
            shutdown,
            report,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    pub fn discovery(&self) -> Option<&Arc<DiscoveryService>> {
        self.discovery.as_ref()
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Handle that stops the host when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Blocks until a `stop` command, the shutdown handle, Ctrl-C or SIGTERM.
    pub async fn run_until_shutdown(&self) {
        let mut listener = self.shutdown.subscribe();
        tokio::select! {
            _ = listener.wait() => info!("Shutdown requested"),
            _ = termination_signal() => info!("Received termination signal"),
        }
    }

    /// Stops modules last-first, then discovery and every endpoint.
    pub async fn shutdown(self) {
        info!(host = %self.config.host_name, "Shutting down module host");
        self.shutdown.trigger();
        self.loader.stop_all().await;
        if let Some(discovery) = &self.discovery {
            discovery.dispose().await;
        }
        self.client.shutdown_all();
        info!("Module host stopped");
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{ECHO_MODULE, PACKAGE};
    use forge_core::ModuleStatus;
    use std::time::Duration;

    fn test_config(root: &std::path::Path) -> HostConfig {
        let mut config = HostConfig::default();
        config.host_name = "unit.host".to_string();
        config.module_directory = root.join("modules");
        config.socket_dir = Some(root.join("sockets"));
        config.discovery.enabled = false;
        config.log.file = None;
        config
    }

    #[tokio::test]
    async fn test_start_publishes_services_and_loads_builtins() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        std::fs::create_dir_all(&config.module_directory).unwrap();
        std::fs::write(
            config.module_directory.join("builtin.toml"),
            format!("package = \"{PACKAGE}\"\n"),
        )
        .unwrap();

        let host = Host::start(config).await.unwrap();
        assert_eq!(host.report().started, vec![ECHO_MODULE]);
        assert!(host.container().contains::<IpcClient>());
        assert!(host.container().contains::<HostConfig>());
        assert!(host.container().contains::<Shutdown>());
        assert!(!host.container().contains::<DiscoveryService>());
        assert!(host.client().is_registered("unit.host"));
        assert!(host.client().is_registered(ECHO_MODULE));

        let handle = host.shutdown_handle();
        handle.trigger();
        tokio::time::timeout(Duration::from_secs(1), host.run_until_shutdown())
            .await
            .unwrap();

        let loader = Arc::clone(host.loader());
        let client = host.client().clone();
        host.shutdown().await;
        assert!(loader.statuses().iter().all(|m| m.status == ModuleStatus::Stopped));
        assert!(client.endpoint_names().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_module_directory() {
        let root = tempfile::tempdir().unwrap();
        let host = Host::start(test_config(root.path())).await.unwrap();
        assert!(host.report().started.is_empty());
        host.shutdown().await;
    }
}

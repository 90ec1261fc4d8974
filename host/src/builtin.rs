//! Modules shipped with the host.

use crate::plugins::PluginCatalog;
use async_trait::async_trait;
use forge_core::{Container, Module, ModuleError, ModuleState, ModuleStatus};
use forge_ipc::{Handlers, IpcClient, MessageKind};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Package name to list in a manifest to load the built-in modules
pub const PACKAGE: &str = "forge.builtin";

pub const ECHO_MODULE: &str = "forge.echo";

pub fn register(catalog: &mut PluginCatalog) {
    catalog.register(PACKAGE, modules);
}

fn modules() -> Vec<Arc<dyn Module>> {
    vec![Arc::new(EchoModule::new())]
}

/// Answers every request on `forge.echo` with its own body and payload.
#[derive(Default)]
pub struct EchoModule {
    state: ModuleState,
    client: Mutex<Option<IpcClient>>,
}

impl EchoModule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Module for EchoModule {
    fn name(&self) -> &str {
        ECHO_MODULE
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    async fn initialize(&self, container: Arc<Container>) -> Result<(), ModuleError> {
        let client = container.get::<IpcClient>()?;
        let responder = (*client).clone();

        client
            .register_listener(
                ECHO_MODULE,
                Handlers::new().on_message(move |request| {
                    if request.kind != MessageKind::Request {
                        debug!(from = %request.from, body = %request.body, "Echo ignoring notification");
                        return;
                    }
                    let responder = responder.clone();
                    let request = request.clone();
                    tokio::spawn(async move {
                        responder
                            .reply(&request, request.body.clone(), request.payload.clone())
                            .await;
                    });
                }),
            )
            .map_err(|e| ModuleError::Other(Box::new(e)))?;

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some((*client).clone());
        info!(endpoint = ECHO_MODULE, "Echo module listening");
        Ok(())
    }

    async fn stop(&self) {
        self.state.set(ModuleStatus::Stopping);
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            client.shutdown(ECHO_MODULE);
        }
        self.state.set(ModuleStatus::Stopped);
    }
}

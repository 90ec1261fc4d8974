use crate::loader::ModuleLoader;
use forge_core::Shutdown;
use forge_ipc::{DiscoveryService, HandlerId, Handlers, IpcClient, IpcResult, Message, MessageKind};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Verbs understood by the host endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Stop,
    Version,
    Modules,
    Peers,
    Ping,
}

impl FromStr for HostCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(HostCommand::Stop),
            "version" => Ok(HostCommand::Version),
            "modules" => Ok(HostCommand::Modules),
            "peers" => Ok(HostCommand::Peers),
            "ping" => Ok(HostCommand::Ping),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostCommand::Stop => "stop",
            HostCommand::Version => "version",
            HostCommand::Modules => "modules",
            HostCommand::Peers => "peers",
            HostCommand::Ping => "ping",
        };
        write!(f, "{}", s)
    }
}

/// Interprets commands and requests sent to the host endpoint.
pub struct CommandDispatcher {
    host_name: String,
    client: IpcClient,
    loader: Arc<ModuleLoader>,
    discovery: Option<Arc<DiscoveryService>>,
    shutdown: Shutdown,
}

impl CommandDispatcher {
    pub fn new(
        host_name: impl Into<String>,
        client: IpcClient,
        loader: Arc<ModuleLoader>,
        discovery: Option<Arc<DiscoveryService>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            client,
            loader,
            discovery,
            shutdown,
        }
    }

    /// Registers on the host endpoint for commands and requests; replies are sent from there.
    pub fn install(self: Arc<Self>) -> IpcResult<Vec<HandlerId>> {
        let on_command = Arc::clone(&self);
        let on_message = Arc::clone(&self);
        self.client.register_listener(
            &self.host_name,
            Handlers::new()
                .on_command(move |m| on_command.dispatch(m))
                .on_message(move |m| on_message.dispatch(m)),
        )
    }

    fn dispatch(&self, message: &Message) {
        if let Some(reply) = self.handle(message) {
            let client = self.client.clone();
            tokio::spawn(async move { client.send(reply).await });
        }
    }

    /// Runs the verb in `message.body` and builds the reply, if any.
    pub fn handle(&self, message: &Message) -> Option<Message> {
        if !matches!(message.kind, MessageKind::Command | MessageKind::Request) {
            debug!(from = %message.from, body = %message.body, "Ignoring message on host endpoint");
            return None;
        }
        let is_request = message.kind == MessageKind::Request;

        let command = match message.body.parse::<HostCommand>() {
            Ok(command) => command,
            Err(verb) => {
                warn!(from = %message.from, verb = %verb, "Unknown host command");
                return is_request
                    .then(|| Message::reply_to(message, format!("unknown command: {verb}")));
            }
        };
        info!(from = %message.from, %command, "Host command");

        match command {
            HostCommand::Stop => {
                self.shutdown.trigger();
                is_request.then(|| Message::reply_to(message, "stopping"))
            }
            HostCommand::Version => Some(Message::reply_to(message, env!("CARGO_PKG_VERSION"))),
            HostCommand::Ping => Some(Message::reply_to(message, "pong")),
            HostCommand::Modules => {
                let payload: Vec<Value> = self
                    .loader
                    .statuses()
                    .iter()
                    .filter_map(|info| serde_json::to_value(info).ok())
                    .collect();
                Some(Message::reply_to(message, "modules").with_payload(payload))
            }
            HostCommand::Peers => {
                let payload: Vec<Value> = self
                    .discovery
                    .as_ref()
                    .map(|d| d.connected_peers())
                    .unwrap_or_default()
                    .into_iter()
                    .map(Value::String)
                    .collect();
                Some(Message::reply_to(message, "peers").with_payload(payload))
            }
        }
    }
}

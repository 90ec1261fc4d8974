//! Process-wide IPC handle: owns the endpoints of this process and sends to others.

use crate::errors::{IpcError, IpcResult};
use crate::handlers::{Category, Handler, HandlerId, HandlerTable, Handlers};
use crate::message::Message;
use crate::transport::{self, ChannelServer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_core::HostConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings for an [`IpcClient`].
#[derive(Debug, Clone)]
pub struct IpcOptions {
    pub socket_dir: PathBuf,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl IpcOptions {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        let defaults = forge_core::IpcSettings::default();
        Self {
            socket_dir: socket_dir.into(),
            connect_timeout: defaults.connect_timeout(),
            response_timeout: defaults.response_timeout(),
            max_frame_bytes: defaults.max_frame_bytes,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

impl From<&HostConfig> for IpcOptions {
    fn from(config: &HostConfig) -> Self {
        Self {
            socket_dir: config.socket_dir(),
            connect_timeout: config.ipc.connect_timeout(),
            response_timeout: config.ipc.response_timeout(),
            max_frame_bytes: config.ipc.max_frame_bytes,
        }
    }
}

struct Endpoint {
    handlers: Arc<HandlerTable>,
    // Dropping the server closes the socket
    _server: ChannelServer,
}

type PendingMap = DashMap<Uuid, oneshot::Sender<Message>>;

struct Inner {
    options: IpcOptions,
    endpoints: DashMap<String, Endpoint>,
    pending: Arc<PendingMap>,
}

/// Cheap to clone; all clones share the same endpoints.
#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("socket_dir", &self.inner.options.socket_dir)
            .field("endpoints", &self.endpoint_names())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

/// Removes the one-shot response handler and the pending entry however `send_and_wait` ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: Uuid,
    handler: Option<(Arc<HandlerTable>, HandlerId)>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some((table, id)) = self.handler.take() {
            table.remove(id);
        }
        self.pending.remove(&self.correlation_id);
    }
}

impl IpcClient {
    pub fn new(options: IpcOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                endpoints: DashMap::new(),
                pending: Arc::new(DashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &IpcOptions {
        &self.inner.options
    }

    pub fn socket_dir(&self) -> &Path {
        &self.inner.options.socket_dir
    }

    /// Handler table of `name`, opening the endpoint first if this process does not own it yet.
    fn endpoint_table(&self, name: &str) -> IpcResult<Arc<HandlerTable>> {
        transport::validate_endpoint_name(name)?;
        match self.inner.endpoints.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(&entry.get().handlers)),
            Entry::Vacant(entry) => {
                let handlers = Arc::new(HandlerTable::new());
                let server = ChannelServer::open(
                    name,
                    &self.inner.options.socket_dir,
                    Arc::clone(&handlers),
                    self.inner.options.max_frame_bytes,
                )?;
                entry.insert(Endpoint {
                    handlers: Arc::clone(&handlers),
                    _server: server,
                });
                Ok(handlers)
            }
        }
    }

    /// Opens `name` with no handlers if it is not open yet.
    pub fn open_endpoint(&self, name: &str) -> IpcResult<()> {
        self.endpoint_table(name).map(|_| ())
    }

    /// Adds the given handlers to `name`, opening the endpoint on first registration.
    /// Handlers accumulate; existing ones are kept.
    pub fn register_listener(&self, name: &str, handlers: Handlers) -> IpcResult<Vec<HandlerId>> {
        let table = self.endpoint_table(name)?;
        let ids: Vec<HandlerId> = handlers
            .into_entries()
            .into_iter()
            .map(|(category, handler)| table.add(category, handler))
            .collect();
        info!(endpoint = name, handlers = ids.len(), "Registered listener");
        Ok(ids)
    }

    /// Like [`register_listener`](Self::register_listener), but only for an endpoint this
    /// call opens itself. Fails with `EndpointInUse` if `name` is already open.
    pub fn register_exclusive(&self, name: &str, handlers: Handlers) -> IpcResult<Vec<HandlerId>> {
        transport::validate_endpoint_name(name)?;
        let Entry::Vacant(entry) = self.inner.endpoints.entry(name.to_string()) else {
            return Err(IpcError::EndpointInUse(name.to_string()));
        };
        let table = Arc::new(HandlerTable::new());
        let ids: Vec<HandlerId> = handlers
            .into_entries()
            .into_iter()
            .map(|(category, handler)| table.add(category, handler))
            .collect();
        let server = ChannelServer::open(
            name,
            &self.inner.options.socket_dir,
            Arc::clone(&table),
            self.inner.options.max_frame_bytes,
        )?;
        entry.insert(Endpoint {
            handlers: table,
            _server: server,
        });
        info!(endpoint = name, handlers = ids.len(), "Registered exclusive listener");
        Ok(ids)
    }

    pub fn register_handler(
        &self,
        name: &str,
        category: Category,
        handler: Handler,
    ) -> IpcResult<HandlerId> {
        let table = self.endpoint_table(name)?;
        Ok(table.add(category, handler))
    }

    /// Removes one handler. The endpoint stays open.
    pub fn unregister_handler(&self, name: &str, id: HandlerId) -> bool {
        self.inner
            .endpoints
            .get(name)
            .map(|endpoint| endpoint.handlers.remove(id))
            .unwrap_or(false)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.endpoints.contains_key(name)
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of handlers across all categories of `name`; 0 if not open.
    pub fn handler_count(&self, name: &str) -> usize {
        self.inner
            .endpoints
            .get(name)
            .map(|endpoint| endpoint.handlers.total())
            .unwrap_or(0)
    }

    /// Correlation ids currently awaited by `send_and_wait`
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Closes `name` and drops its handlers. Returns false if it was not open.
    pub fn shutdown(&self, name: &str) -> bool {
        match self.inner.endpoints.remove(name) {
            Some(_) => {
                info!(endpoint = name, "Endpoint shut down");
                true
            }
            None => false,
        }
    }

    pub fn shutdown_all(&self) {
        let names = self.endpoint_names();
        for name in &names {
            self.shutdown(name);
        }
        debug!(count = names.len(), "All endpoints shut down");
    }

    /// Fire-and-forget delivery; failures are logged.
    pub async fn send(&self, message: Message) {
        if let Err(e) = self.try_send(&message).await {
            warn!(to = %message.to, from = %message.from, error = %e, "Failed to send message");
        }
    }

    pub async fn try_send(&self, message: &Message) -> IpcResult<()> {
        transport::send(
            &self.inner.options.socket_dir,
            message,
            self.inner.options.connect_timeout,
        )
        .await
    }

    /// Sends `message` as a Request from `message.from` and waits for the Response carrying
    /// its correlation id. `timeout` defaults to the configured response timeout.
    pub async fn send_and_wait(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> IpcResult<Message> {
        let mut message = message.into_request();
        let correlation_id = *message.correlation_id.get_or_insert_with(Uuid::new_v4);
        let timeout = timeout.unwrap_or(self.inner.options.response_timeout);

        let (tx, rx) = oneshot::channel();
        match self.inner.pending.entry(correlation_id) {
            Entry::Occupied(_) => return Err(IpcError::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        let mut guard = PendingGuard {
            pending: &self.inner.pending,
            correlation_id,
            handler: None,
        };

        let table = self.endpoint_table(&message.from)?;
        let pending = Arc::clone(&self.inner.pending);
        let handler_id = table.add(
            Category::Response,
            Arc::new(move |response: &Message| {
                if response.correlation_id != Some(correlation_id) {
                    return;
                }
                if let Some((_, tx)) = pending.remove(&correlation_id) {
                    let _ = tx.send(response.clone());
                }
            }),
        );
        guard.handler = Some((table, handler_id));

        debug!(
            to = %message.to,
            from = %message.from,
            body = %message.body,
            %correlation_id,
            "Sending request"
        );
        self.try_send(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IpcError::DeliveryFailed {
                to: message.to.clone(),
                reason: "response channel closed".to_string(),
            }),
            Err(_) => {
                warn!(to = %message.to, %correlation_id, ?timeout, "Request timed out");
                Err(IpcError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    /// Sends the Response to `request` from the endpoint it was addressed to.
    pub async fn reply(&self, request: &Message, body: impl Into<String>, payload: Option<Vec<Value>>) {
        let mut response = Message::reply_to(request, body);
        response.payload = payload;
        self.send(response).await;
    }
}

//! LAN discovery and cross-host relay.
//!
//! Hosts announce themselves with UDP beacons and link up over TCP. A linked peer gets a local
//! forwarding endpoint under its name, so local modules address remote hosts exactly like local
//! endpoints. Everything on a peer link is newline-delimited JSON; the first line is the
//! handshake `{"name": "<host name>"}`.

use crate::client::IpcClient;
use crate::errors::{IpcError, IpcResult};
use crate::handlers::{Handler, Handlers};
use crate::message::Message;
use crate::transport::validate_endpoint_name;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_core::{HostConfig, Shutdown, ShutdownListener};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BEACON_BYTES: usize = 2048;
const MAX_HANDSHAKE_BYTES: usize = 4096;

/// UDP announcement of a host and the TCP port it accepts peers on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub name: String,
    pub port: u16,
}

/// A host found through its beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub name: String,
    /// Address the beacon was sent from
    pub addr: SocketAddr,
    /// TCP port advertised in the beacon
    pub tcp_port: u16,
}

impl DiscoveredHost {
    /// Where to connect for a peer link
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.tcp_port)
    }
}

#[derive(Deserialize)]
struct HandshakeLine {
    #[serde(alias = "pipe", alias = "Pipe")]
    name: Option<String>,
}

/// Extracts the peer name from a handshake line.
fn parse_handshake(line: &str) -> IpcResult<String> {
    let handshake: HandshakeLine = serde_json::from_str(line.trim())
        .map_err(|e| IpcError::Handshake(format!("malformed handshake: {e}")))?;
    let name = handshake.name.map(|n| n.trim().to_string()).unwrap_or_default();
    if name.is_empty() {
        return Err(IpcError::Handshake("handshake carries no name".to_string()));
    }
    validate_endpoint_name(&name)?;
    Ok(name)
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Name announced in beacons and sent in handshakes
    pub host_name: String,
    pub bind_address: IpAddr,
    pub udp_port: u16,
    /// Port 0 picks a free port; see [`DiscoveryService::local_addr`]
    pub tcp_port: u16,
    /// Destination of beacons, the limited broadcast address by default
    pub beacon_address: IpAddr,
    /// Zero disables beacons
    pub beacon_interval: Duration,
    pub handshake_timeout: Duration,
    /// Longest message line accepted from a peer; longer lines drop the link
    pub max_line_bytes: usize,
}

impl DiscoveryConfig {
    pub fn from_host_config(config: &HostConfig) -> IpcResult<Self> {
        let bind_address = config
            .discovery
            .bind_address
            .parse()
            .map_err(|_| IpcError::InvalidAddress(config.discovery.bind_address.clone()))?;
        Ok(Self {
            host_name: config.host_name.clone(),
            bind_address,
            udp_port: config.discovery.udp_port,
            tcp_port: config.discovery.tcp_port,
            beacon_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            beacon_interval: config.discovery.beacon_interval(),
            handshake_timeout: config.discovery.handshake_timeout(),
            max_line_bytes: config.ipc.max_frame_bytes,
        })
    }
}

/// Reads one line of at most `limit` bytes, newline included. `Ok(None)` at end of stream.
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> IpcResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader).take(limit as u64 + 1).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if read > limit {
        return Err(IpcError::FrameTooLarge { size: read, limit });
    }
    Ok(Some(line))
}

/// A live peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

struct Peer {
    id: u64,
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: Mutex<OwnedWriteHalf>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    client: IpcClient,
    config: DiscoveryConfig,
    local_addr: SocketAddr,
    peers: DashMap<String, Arc<Peer>>,
    next_peer_id: AtomicU64,
    shutdown: Shutdown,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Beacon broadcaster, TCP peer acceptor and relay.
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("host_name", &self.inner.config.host_name)
            .field("local_addr", &self.inner.local_addr)
            .field("peers", &self.connected_peers())
            .finish()
    }
}

impl DiscoveryService {
    /// Binds the TCP listener and starts the accept and beacon loops.
    pub async fn start(client: IpcClient, config: DiscoveryConfig) -> IpcResult<Self> {
        let listener = TcpListener::bind((config.bind_address, config.tcp_port)).await?;
        let local_addr = listener.local_addr()?;

        let beacon_socket = if config.beacon_interval.is_zero() {
            None
        } else {
            let socket = UdpSocket::bind((config.bind_address, 0)).await?;
            socket.set_broadcast(true)?;
            Some(socket)
        };

        let inner = Arc::new(Inner {
            client,
            config,
            local_addr,
            peers: DashMap::new(),
            next_peer_id: AtomicU64::new(0),
            shutdown: Shutdown::new(),
            tasks: StdMutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(accept_loop(
            Arc::downgrade(&inner),
            listener,
            inner.shutdown.subscribe(),
        ))];

        if let Some(socket) = beacon_socket {
            let beacon = serde_json::to_vec(&Beacon {
                name: inner.config.host_name.clone(),
                port: local_addr.port(),
            })?;
            let target = SocketAddr::new(inner.config.beacon_address, inner.config.udp_port);
            tasks.push(tokio::spawn(beacon_loop(
                socket,
                target,
                beacon,
                inner.config.beacon_interval,
                inner.shutdown.subscribe(),
            )));
        }
        inner.lock_tasks().extend(tasks);

        info!(
            host = %inner.config.host_name,
            tcp = %local_addr,
            udp_port = inner.config.udp_port,
            "Discovery service started"
        );
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn host_name(&self) -> &str {
        &self.inner.config.host_name
    }

    /// Names of connected peers, sorted
    pub fn connected_peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.peers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .peers
            .iter()
            .map(|p| PeerInfo {
                name: p.key().clone(),
                addr: p.addr,
                connected_at: p.connected_at,
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner.peers.contains_key(name)
    }

    /// Dials a peer, sends our handshake and links it under `remote_name`.
    pub async fn connect(&self, addr: SocketAddr, remote_name: &str) -> IpcResult<()> {
        validate_endpoint_name(remote_name)?;
        let timeout = self.inner.config.handshake_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(IpcError::Io(e)),
            Err(_) => {
                return Err(IpcError::Handshake(format!(
                    "connect to {addr} timed out after {timeout:?}"
                )))
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let mut line = serde_json::to_vec(&serde_json::json!({ "name": self.inner.config.host_name }))?;
        line.push(b'\n');
        write_half.write_all(&line).await?;
        write_half.flush().await?;

        self.inner
            .register_peer(remote_name.to_string(), addr, BufReader::new(read_half), write_half)
    }

    /// Relays to a connected peer when `message.to` names one, otherwise delivers locally.
    pub async fn deliver(&self, message: &Message) -> IpcResult<()> {
        if self.inner.peers.contains_key(&message.to) {
            self.inner.relay(&message.to, message).await
        } else {
            self.inner.client.try_send(message).await
        }
    }

    /// Writes `message` to the peer named by `message.to`.
    pub async fn relay(&self, message: &Message) -> IpcResult<()> {
        self.inner.relay(&message.to, message).await
    }

    /// Drops the link to `name` and its forwarding endpoint.
    pub async fn disconnect(&self, name: &str) -> bool {
        let id = match self.inner.peers.get(name) {
            Some(peer) => peer.id,
            None => return false,
        };
        self.inner.remove_peer(name, id).await
    }

    /// Stops the loops and disconnects every peer.
    pub async fn dispose(&self) {
        self.inner.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.lock_tasks());
        for task in tasks {
            task.abort();
        }
        for name in self.connected_peers() {
            self.disconnect(&name).await;
        }
        info!(host = %self.inner.config.host_name, "Discovery service stopped");
    }
}

impl Inner {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn accept_peer(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut shutdown = self.shutdown.subscribe();

        let read = tokio::select! {
            _ = shutdown.wait() => {
                debug!(%addr, "Service stopping, dropping connection before handshake");
                return;
            }
            read = tokio::time::timeout(
                self.config.handshake_timeout,
                read_bounded_line(&mut reader, MAX_HANDSHAKE_BYTES),
            ) => read,
        };
        let name = match read {
            Ok(Ok(None)) => {
                debug!(%addr, "Connection closed before handshake");
                return;
            }
            Ok(Ok(Some(line))) => match parse_handshake(&line) {
                Ok(name) => name,
                Err(e) => {
                    warn!(%addr, error = %e, "Rejected peer connection");
                    return;
                }
            },
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "Failed to read handshake");
                return;
            }
            Err(_) => {
                warn!(%addr, timeout = ?self.config.handshake_timeout, "Handshake timed out");
                return;
            }
        };

        if let Err(e) = self.register_peer(name, addr, reader, write_half) {
            warn!(%addr, error = %e, "Rejected peer connection");
        }
    }

    /// Records the peer, installs its forwarding endpoint and starts its reader and writer pump.
    fn register_peer(
        self: &Arc<Self>,
        name: String,
        addr: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> IpcResult<()> {
        if self.shutdown.is_triggered() {
            return Err(IpcError::Handshake("discovery service disposed".to_string()));
        }

        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer {
            id,
            addr,
            connected_at: Utc::now(),
            writer: Mutex::new(writer),
            tasks: StdMutex::new(Vec::new()),
        });
        match self.peers.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(IpcError::Handshake(format!(
                    "peer '{name}' is already connected"
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&peer));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let forward: Handler = Arc::new(move |message: &Message| {
            let _ = tx.send(message.clone());
        });
        match self.client.register_exclusive(&name, Handlers::all(forward)) {
            Ok(_) => {}
            Err(IpcError::EndpointInUse(_)) => {
                self.peers.remove_if(&name, |_, p| p.id == id);
                return Err(IpcError::Handshake(format!(
                    "'{name}' is already an open endpoint"
                )));
            }
            Err(e) => {
                self.peers.remove_if(&name, |_, p| p.id == id);
                return Err(e);
            }
        }
        // dispose() may have started after the first check; it will not see this peer then.
        if self.shutdown.is_triggered() {
            self.peers.remove_if(&name, |_, p| p.id == id);
            self.client.shutdown(&name);
            return Err(IpcError::Handshake("discovery service disposed".to_string()));
        }

        let weak = Arc::downgrade(self);
        let reader_task = tokio::spawn(read_peer(
            weak.clone(),
            name.clone(),
            id,
            reader,
            self.config.max_line_bytes,
        ));
        let pump_task = tokio::spawn(pump_peer(weak, name.clone(), rx));
        peer.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([reader_task, pump_task]);

        info!(peer = %name, %addr, "Peer connected");
        Ok(())
    }

    async fn relay(&self, name: &str, message: &Message) -> IpcResult<()> {
        let peer = self
            .peers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| IpcError::PeerNotConnected(name.to_string()))?;

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let written = {
            let mut writer = peer.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(()) => {
                debug!(peer = name, from = %message.from, body = %message.body, "Relayed message");
                Ok(())
            }
            Err(e) => {
                warn!(peer = name, error = %e, "Relay failed, dropping peer");
                self.remove_peer(name, peer.id).await;
                Err(IpcError::DeliveryFailed {
                    to: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Removes the peer if it is still the connection identified by `id`.
    async fn remove_peer(&self, name: &str, id: u64) -> bool {
        let Some((_, peer)) = self.peers.remove_if(name, |_, p| p.id == id) else {
            return false;
        };
        self.client.shutdown(name);
        if let Err(e) = peer.writer.lock().await.shutdown().await {
            debug!(peer = name, error = %e, "Failed to close peer socket");
        }
        // May abort the calling task; nothing below awaits.
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *peer.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!(peer = name, addr = %peer.addr, "Peer disconnected");
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn accept_loop(inner: Weak<Inner>, listener: TcpListener, mut shutdown: ShutdownListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept peer connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            }
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(%addr, "Accepted peer connection");
        tokio::spawn(inner.accept_peer(stream, addr));
    }
    debug!("Peer accept loop stopped");
}

async fn beacon_loop(
    socket: UdpSocket,
    target: SocketAddr,
    beacon: Vec<u8>,
    interval: Duration,
    mut shutdown: ShutdownListener,
) {
    loop {
        if let Err(e) = socket.send_to(&beacon, target).await {
            debug!(%target, error = %e, "Failed to send beacon");
        }
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Beacon loop stopped");
}

/// Delivers every line from the peer to the local endpoint it names.
async fn read_peer(
    inner: Weak<Inner>,
    name: String,
    id: u64,
    mut reader: BufReader<OwnedReadHalf>,
    max_line_bytes: usize,
) {
    loop {
        match read_bounded_line(&mut reader, max_line_bytes).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match serde_json::from_str::<Message>(&line) {
                    Ok(message) => inner.client.send(message.normalized()).await,
                    Err(e) => warn!(peer = %name, error = %e, "Dropping malformed message from peer"),
                }
            }
            Ok(None) => {
                debug!(peer = %name, "Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(peer = %name, error = %e, "Failed to read from peer, dropping link");
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.remove_peer(&name, id).await;
    }
}

/// Writes messages that arrive on the forwarding endpoint to the peer, in order.
async fn pump_peer(inner: Weak<Inner>, name: String, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.relay(&name, &message).await.is_err() {
            break;
        }
    }
}

/// Binds `0.0.0.0:<port>` and waits for a beacon from `expected_name`.
pub async fn wait_for_beacon(
    port: u16,
    expected_name: &str,
    timeout: Duration,
) -> IpcResult<Option<DiscoveredHost>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    let never = Shutdown::new();
    let mut listener = never.subscribe();
    Ok(wait_for_beacon_on(&socket, expected_name, timeout, &mut listener).await)
}

/// Returns the first beacon naming `expected_name`. Malformed and foreign beacons are skipped.
/// `None` on timeout or shutdown.
pub async fn wait_for_beacon_on(
    socket: &UdpSocket,
    expected_name: &str,
    timeout: Duration,
    shutdown: &mut ShutdownListener,
) -> Option<DiscoveredHost> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut buf = vec![0u8; MAX_BEACON_BYTES];

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!(expected = expected_name, "No beacon before timeout");
                return None;
            }
            _ = shutdown.wait() => return None,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match serde_json::from_slice::<Beacon>(&buf[..len]) {
                    Ok(beacon) if beacon.name == expected_name => {
                        info!(host = %beacon.name, %from, port = beacon.port, "Found host");
                        return Some(DiscoveredHost {
                            name: beacon.name,
                            addr: from,
                            tcp_port: beacon.port,
                        });
                    }
                    Ok(beacon) => debug!(host = %beacon.name, %from, "Ignoring beacon"),
                    Err(e) => debug!(%from, error = %e, "Ignoring malformed beacon"),
                },
                Err(e) => debug!(error = %e, "Failed to receive beacon"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IpcOptions;
    use std::path::Path;
    use tokio::io::AsyncReadExt;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_config(name: &str) -> DiscoveryConfig {
        DiscoveryConfig {
            host_name: name.to_string(),
            bind_address: LOCALHOST,
            udp_port: 0,
            tcp_port: 0,
            beacon_address: LOCALHOST,
            beacon_interval: Duration::ZERO,
            handshake_timeout: Duration::from_millis(500),
            max_line_bytes: 64 * 1024,
        }
    }

    async fn start_host(name: &str, dir: &Path) -> (IpcClient, DiscoveryService) {
        let client = IpcClient::new(IpcOptions::new(dir));
        let service = DiscoveryService::start(client.clone(), test_config(name))
            .await
            .unwrap();
        (client, service)
    }

    fn recording_endpoint(client: &IpcClient, name: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        client
            .register_listener(
                name,
                Handlers::all(Arc::new(move |m: &Message| {
                    let _ = tx.send(m.clone());
                })),
            )
            .unwrap();
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..40 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    /// Connects raw, sends `handshake` and reports whether the server closed the link.
    async fn raw_handshake_is_rejected(addr: SocketAddr, handshake: &str) -> bool {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(handshake.as_bytes()).await.unwrap();
        let mut buf = [0u8; 16];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[test]
    fn test_parse_handshake() {
        assert_eq!(parse_handshake("{\"name\":\"lab\"}\n").unwrap(), "lab");
        assert_eq!(parse_handshake("{\"pipe\":\"lab\"}").unwrap(), "lab");
        assert_eq!(parse_handshake("{\"Pipe\":\"lab\"}").unwrap(), "lab");
        assert!(parse_handshake("hello").is_err());
        assert!(parse_handshake("{}").is_err());
        assert!(parse_handshake("{\"name\":\"  \"}").is_err());
        assert!(parse_handshake("{\"name\":\"a/b\"}").is_err());
    }

    #[tokio::test]
    async fn test_malformed_handshakes_register_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (client, service) = start_host("b.host", dir.path()).await;
        client.open_endpoint("taken").unwrap();

        for handshake in ["not json\n", "{}\n", "{\"name\":\"\"}\n", "{\"name\":\"taken\"}\n"] {
            assert!(
                raw_handshake_is_rejected(service.local_addr(), handshake).await,
                "{handshake:?} was accepted"
            );
        }
        assert!(service.connected_peers().is_empty());
        assert_eq!(client.endpoint_names(), vec!["taken"]);
        service.dispose().await;
    }

    #[tokio::test]
    async fn test_handshake_after_dispose_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (client, service) = {
            let client = IpcClient::new(IpcOptions::new(dir.path()));
            let mut config = test_config("b.host");
            config.handshake_timeout = Duration::from_secs(5);
            let service = DiscoveryService::start(client.clone(), config).await.unwrap();
            (client, service)
        };

        let mut stream = TcpStream::connect(service.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.dispose().await;

        // Writing may already fail once the server has dropped the connection
        let _ = stream.write_all(b"{\"name\":\"late.peer\"}\n").await;
        let mut buf = [0u8; 16];
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
        assert!(service.connected_peers().is_empty());
        assert!(client.endpoint_names().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_handshake_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::new(IpcOptions::new(dir.path()));
        let mut config = test_config("b.host");
        config.handshake_timeout = Duration::from_secs(10);
        let service = DiscoveryService::start(client, config).await.unwrap();

        let mut stream = TcpStream::connect(service.local_addr()).await.unwrap();
        let _ = stream.write_all(&vec![b'a'; 64 * 1024]).await;
        let mut buf = [0u8; 16];
        // Dropped for size, long before the handshake timeout
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
        assert!(service.connected_peers().is_empty());
        service.dispose().await;
    }

    #[tokio::test]
    async fn test_oversized_peer_line_drops_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::new(IpcOptions::new(dir.path()));
        let mut config = test_config("b.host");
        config.max_line_bytes = 1024;
        let service = DiscoveryService::start(client.clone(), config).await.unwrap();

        let mut stream = TcpStream::connect(service.local_addr()).await.unwrap();
        stream.write_all(b"{\"name\":\"noisy.host\"}\n").await.unwrap();
        assert!(eventually(|| service.is_connected("noisy.host")).await);

        let _ = stream.write_all(&vec![b'x'; 8 * 1024]).await;
        assert!(eventually(|| !service.is_connected("noisy.host")).await);
        assert!(!client.is_registered("noisy.host"));
        service.dispose().await;
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_after_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (_client, service) = start_host("b.host", dir.path()).await;

        let mut stream = TcpStream::connect(service.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
        assert!(service.connected_peers().is_empty());
        service.dispose().await;
    }

    #[tokio::test]
    async fn test_linked_hosts_relay_both_ways() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (client_a, service_a) = start_host("a.host", dir_a.path()).await;
        let (client_b, service_b) = start_host("b.host", dir_b.path()).await;
        let mut inbox_a = recording_endpoint(&client_a, "a.host");
        let mut inbox_b = recording_endpoint(&client_b, "b.host");

        service_a.connect(service_b.local_addr(), "b.host").await.unwrap();
        assert_eq!(service_a.connected_peers(), vec!["b.host"]);
        assert_eq!(service_a.peers()[0].addr, service_b.local_addr());
        assert!(eventually(|| service_b.is_connected("a.host")).await);
        assert!(client_a.is_registered("b.host"));

        // Direct relay
        service_a
            .deliver(&Message::notification("b.host", "a.mod", "direct"))
            .await
            .unwrap();
        let got = recv(&mut inbox_b).await;
        assert_eq!(got.body, "direct");
        assert_eq!(got.from, "a.mod");

        // Through the local forwarding endpoint
        client_a
            .try_send(&Message::command("b.host", "a.mod", "forwarded"))
            .await
            .unwrap();
        assert_eq!(recv(&mut inbox_b).await.body, "forwarded");

        // And back
        client_b
            .try_send(&Message::notification("a.host", "b.mod", "back"))
            .await
            .unwrap();
        assert_eq!(recv(&mut inbox_a).await.body, "back");

        // Local names still go through the local transport
        service_a
            .deliver(&Message::notification("a.host", "a.mod", "local"))
            .await
            .unwrap();
        assert_eq!(recv(&mut inbox_a).await.body, "local");

        service_a.dispose().await;
        service_b.dispose().await;
    }

    #[tokio::test]
    async fn test_duplicate_peer_name_is_rejected() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (_client_a, service_a) = start_host("a.host", dir_a.path()).await;
        let (_client_b, service_b) = start_host("b.host", dir_b.path()).await;

        service_a.connect(service_b.local_addr(), "b.host").await.unwrap();
        assert!(eventually(|| service_b.is_connected("a.host")).await);

        assert!(raw_handshake_is_rejected(service_b.local_addr(), "{\"name\":\"a.host\"}\n").await);
        assert_eq!(service_b.connected_peers(), vec!["a.host"]);
        assert!(service_a.connect(service_b.local_addr(), "b.host").await.is_err());

        service_a.dispose().await;
        service_b.dispose().await;
    }

    #[tokio::test]
    async fn test_peer_loss_removes_forwarding_endpoint() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (client_a, service_a) = start_host("a.host", dir_a.path()).await;
        let (_client_b, service_b) = start_host("b.host", dir_b.path()).await;

        service_a.connect(service_b.local_addr(), "b.host").await.unwrap();
        assert!(eventually(|| service_b.is_connected("a.host")).await);

        service_b.dispose().await;
        assert!(eventually(|| !service_a.is_connected("b.host")).await);
        assert!(!client_a.is_registered("b.host"));
        assert!(matches!(
            service_a.relay(&Message::notification("b.host", "a", "x")).await,
            Err(IpcError::PeerNotConnected(_))
        ));
        service_a.dispose().await;
    }

    #[tokio::test]
    async fn test_disconnect() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (client_a, service_a) = start_host("a.host", dir_a.path()).await;
        let (_client_b, service_b) = start_host("b.host", dir_b.path()).await;

        service_a.connect(service_b.local_addr(), "b.host").await.unwrap();
        assert!(service_a.disconnect("b.host").await);
        assert!(!service_a.disconnect("b.host").await);
        assert!(!client_a.is_registered("b.host"));
        assert!(eventually(|| !service_b.is_connected("a.host")).await);

        service_a.dispose().await;
        service_b.dispose().await;
    }

    #[tokio::test]
    async fn test_wait_for_beacon_skips_foreign_and_malformed() {
        let listener = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let target = listener.local_addr().unwrap();
        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();

        sender.send_to(b"garbage", target).await.unwrap();
        let foreign = serde_json::to_vec(&Beacon { name: "other".into(), port: 1 }).unwrap();
        sender.send_to(&foreign, target).await.unwrap();
        let wanted = serde_json::to_vec(&Beacon { name: "lab".into(), port: 4242 }).unwrap();
        sender.send_to(&wanted, target).await.unwrap();

        let shutdown = Shutdown::new();
        let found = wait_for_beacon_on(&listener, "lab", Duration::from_secs(2), &mut shutdown.subscribe())
            .await
            .unwrap();
        assert_eq!(found.name, "lab");
        assert_eq!(found.addr, sender.local_addr().unwrap());
        assert_eq!(found.tcp_addr(), SocketAddr::new(LOCALHOST, 4242));
    }

    #[tokio::test]
    async fn test_wait_for_beacon_times_out_or_cancels() {
        let listener = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let shutdown = Shutdown::new();
        let none = wait_for_beacon_on(&listener, "lab", Duration::from_millis(100), &mut shutdown.subscribe()).await;
        assert!(none.is_none());

        shutdown.trigger();
        let started = std::time::Instant::now();
        let none = wait_for_beacon_on(&listener, "lab", Duration::from_secs(10), &mut shutdown.subscribe()).await;
        assert!(none.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_service_broadcasts_its_tcp_port() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let mut config = test_config("beacon.host");
        config.udp_port = listener.local_addr().unwrap().port();
        config.beacon_interval = Duration::from_secs(1);

        let service = DiscoveryService::start(IpcClient::new(IpcOptions::new(dir.path())), config)
            .await
            .unwrap();
        let shutdown = Shutdown::new();
        let found = wait_for_beacon_on(&listener, "beacon.host", Duration::from_secs(3), &mut shutdown.subscribe())
            .await
            .unwrap();
        assert_eq!(found.tcp_port, service.local_addr().port());
        service.dispose().await;
    }
}

// This crate centralizes Inter-Process Communication definitions and logic.

pub mod codec; // Length-prefixed JSON frames for local channels
pub mod client; // Endpoint ownership, send and send-and-wait
pub mod discovery; // UDP beacons, TCP peer links, relay to other hosts
pub mod errors;
pub mod handlers; // Per-endpoint handler tables
pub mod message; // Wire envelope shared by every endpoint
pub mod transport; // Unix-socket channel server and sender

pub use client::{IpcClient, IpcOptions};
pub use discovery::{
    wait_for_beacon, wait_for_beacon_on, Beacon, DiscoveredHost, DiscoveryConfig, DiscoveryService,
    PeerInfo,
};
pub use errors::{IpcError, IpcResult};
pub use handlers::{Category, Handler, HandlerId, Handlers};
pub use message::{Message, MessageKind};

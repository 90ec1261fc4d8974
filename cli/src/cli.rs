use clap::{Parser, Subcommand, ValueEnum};
use forge_ipc::MessageKind;
use std::path::PathBuf;

/// Control client for a running forge-hostd
#[derive(Parser, Debug)]
#[command(name = "forgectl", author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Endpoint name of the target host (defaults to the configured host name)
    #[arg(long, global = true, env = "FORGE_HOST_NAME")]
    pub host: Option<String>,

    /// Directory holding endpoint sockets
    #[arg(long, global = true, env = "FORGE_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,

    /// Milliseconds to wait for a response
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the host answers
    Ping,
    /// Show the host version
    Version,
    /// List loaded modules and their status
    Modules,
    /// List connected peer hosts
    Peers,
    /// Ask the host to shut down
    Stop,
    /// Send an arbitrary message to any endpoint
    Send {
        /// Receiving endpoint
        to: String,
        /// Message body
        body: String,
        /// JSON array used as payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, value_enum, default_value_t = Kind::Request)]
        kind: Kind,
    },
    /// Wait for a beacon from a host on the LAN
    Discover {
        /// Host name to look for (defaults to the target host)
        name: Option<String>,
        /// UDP port beacons are sent to
        #[arg(long)]
        udp_port: Option<u16>,
        /// Seconds to wait
        #[arg(long, default_value_t = 20)]
        wait_secs: u64,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Command,
    Notification,
}

impl From<Kind> for MessageKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Request => MessageKind::Request,
            Kind::Command => MessageKind::Command,
            Kind::Notification => MessageKind::Notification,
        }
    }
}

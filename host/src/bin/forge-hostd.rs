use clap::Parser;
use forge_core::{logging, HostConfig};
use forge_host::Host;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "forge-hostd", version, about = "Forge module host daemon")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint name of this host
    #[arg(long)]
    host_name: Option<String>,

    /// Directory scanned for plugin manifests
    #[arg(short, long)]
    module_dir: Option<PathBuf>,

    /// Directory holding endpoint sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// UDP port for beacons
    #[arg(long)]
    udp_port: Option<u16>,

    /// TCP port for peer links
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Do not announce or accept peers
    #[arg(long)]
    no_discovery: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut HostConfig) {
        if let Some(name) = self.host_name {
            config.host_name = name;
        }
        if let Some(dir) = self.module_dir {
            config.module_directory = dir;
        }
        if let Some(dir) = self.socket_dir {
            config.socket_dir = Some(dir);
        }
        if let Some(port) = self.udp_port {
            config.discovery.udp_port = port;
        }
        if let Some(port) = self.tcp_port {
            config.discovery.tcp_port = port;
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config from file or use defaults
    let mut config = HostConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    args.apply(&mut config);

    logging::init(&config.log)?;
    info!(
        host = %config.host_name,
        module_dir = %config.module_directory.display(),
        socket_dir = %config.socket_dir().display(),
        "Starting forge-hostd"
    );

    let host = match Host::start(config).await {
        Ok(host) => host,
        Err(e) => {
            error!(error = %e, "Failed to start module host");
            return Err(e.into());
        }
    };

    host.run_until_shutdown().await;
    host.shutdown().await;

    info!("forge-hostd exiting");
    Ok(())
}

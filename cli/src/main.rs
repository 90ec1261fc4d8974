use clap::Parser;
use forge_core::{logging, HostConfig, LogSettings};
use forge_ipc::{wait_for_beacon, IpcClient, IpcOptions, Message, MessageKind};
use serde_json::Value;
use std::process::ExitCode;
use std::time::Duration;

mod cli;
mod output;

use crate::cli::{Args, Command};
use crate::output::{print_discovered, print_error, print_modules, print_peers, print_response};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log = LogSettings {
        level: if args.verbose { "debug" } else { "warn" }.to_string(),
        file: None,
        ..LogSettings::default()
    };
    if let Err(e) = logging::init(&log) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = HostConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.socket_dir {
        config.socket_dir = Some(dir);
    }
    if let Some(ms) = args.timeout_ms {
        config.ipc.response_timeout_ms = ms;
    }
    let host = args.host.unwrap_or_else(|| config.host_name.clone());

    if let Command::Discover {
        name,
        udp_port,
        wait_secs,
    } = args.command
    {
        let name = name.unwrap_or(host);
        let port = udp_port.unwrap_or(config.discovery.udp_port);
        return discover(port, &name, wait_secs).await;
    }

    let client = IpcClient::new(IpcOptions::from(&config));
    let me = format!("forgectl-{}", std::process::id());
    let result = dispatch(&client, &me, &host, args.command).await;
    client.shutdown_all();
    result
}

async fn dispatch(client: &IpcClient, me: &str, host: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ping | Command::Version => {
            let verb = if matches!(command, Command::Ping) { "ping" } else { "version" };
            let response = client.send_and_wait(Message::request(host, me, verb), None).await?;
            print_response(&response);
        }
        Command::Modules => {
            let response = client.send_and_wait(Message::request(host, me, "modules"), None).await?;
            print_modules(&response);
        }
        Command::Peers => {
            let response = client.send_and_wait(Message::request(host, me, "peers"), None).await?;
            print_peers(&response);
        }
        Command::Stop => {
            let response = client.send_and_wait(Message::request(host, me, "stop"), None).await?;
            print_response(&response);
        }
        Command::Send {
            to,
            body,
            payload,
            kind,
        } => {
            let mut message = Message::new(to, me, body, MessageKind::from(kind));
            if let Some(raw) = payload {
                let values: Vec<Value> = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("--payload must be a JSON array: {}", e))?;
                message = message.with_payload(values);
            }
            if message.kind == MessageKind::Request {
                let response = client.send_and_wait(message, None).await?;
                print_response(&response);
            } else {
                client.try_send(&message).await?;
                println!("Sent {:?} to {}", message.kind, message.to);
            }
        }
        Command::Discover { .. } => {
            return Err(anyhow::anyhow!("discover does not talk to a host endpoint"))
        }
    }
    Ok(())
}

async fn discover(port: u16, name: &str, wait_secs: u64) -> anyhow::Result<()> {
    println!("Waiting up to {}s for a beacon from {} on UDP {}", wait_secs, name, port);
    match wait_for_beacon(port, name, Duration::from_secs(wait_secs)).await? {
        Some(found) => {
            print_discovered(&found);
            Ok(())
        }
        None => Err(anyhow::anyhow!("No beacon from {} within {}s", name, wait_secs)),
    }
}

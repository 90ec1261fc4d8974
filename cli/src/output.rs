use colored::*;
use forge_ipc::{DiscoveredHost, Message};
use serde_json::Value;

/// Print a generic response: body, then the payload one value per line
pub fn print_response(response: &Message) {
    println!("{}: {}", response.from.blue().bold(), response.body);
    if let Some(payload) = &response.payload {
        for value in payload {
            println!("  {}", value);
        }
    }
}

/// Render the payload of a `modules` reply as a table
pub fn format_modules(payload: &[Value]) -> Vec<String> {
    payload
        .iter()
        .map(|module| {
            let field = |key: &str| module.get(key).and_then(Value::as_str).unwrap_or("?").to_string();
            format!("{:<32} {:<10} {}", field("name"), field("version"), field("status"))
        })
        .collect()
}

pub fn print_modules(response: &Message) {
    let payload = response.payload.as_deref().unwrap_or_default();
    if payload.is_empty() {
        println!("{}", "No modules loaded".yellow());
        return;
    }
    println!("{}", format!("{:<32} {:<10} {}", "MODULE", "VERSION", "STATUS").bold());
    for (line, module) in format_modules(payload).into_iter().zip(payload) {
        let status = module.get("status").and_then(Value::as_str).unwrap_or("");
        match status {
            "running" => println!("{}", line.green()),
            "error" => println!("{}", line.red()),
            _ => println!("{}", line),
        }
    }
}

pub fn print_peers(response: &Message) {
    let peers: Vec<&str> = response
        .payload
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    if peers.is_empty() {
        println!("{}", "No connected peers".yellow());
    }
    for peer in peers {
        println!("  {}", peer.cyan());
    }
}

pub fn print_discovered(host: &DiscoveredHost) {
    println!(
        "{} {} at {}",
        "Found".green().bold(),
        host.name.bold(),
        host.tcp_addr()
    );
}

pub fn print_error(message: &str) {
    eprintln!("{}: {}", "Error".red().bold(), message);
}

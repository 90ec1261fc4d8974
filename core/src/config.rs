use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config and runtime directories
pub const APP_NAME: &str = "forge";

/// Well-known endpoint name of the host process
pub const DEFAULT_HOST_NAME: &str = "forge.host";

/// Top-level configuration for the module host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Endpoint name the host listens on and announces in beacons
    pub host_name: String,
    /// Directory scanned for plugin manifests
    pub module_directory: PathBuf,
    /// Directory holding the endpoint sockets. Defaults to the user runtime dir.
    pub socket_dir: Option<PathBuf>,
    pub log: LogSettings,
    pub ipc: IpcSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Optional log file; rotated on startup
    pub file: Option<PathBuf>,
    /// Number of rotated log files to keep
    pub max_log_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpcSettings {
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub bind_address: String,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub beacon_interval_secs: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            module_directory: PathBuf::from("./modules"),
            socket_dir: None,
            log: LogSettings::default(),
            ipc: IpcSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("./logs/forge.log")),
            max_log_files: 10,
        }
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            response_timeout_ms: 30_000,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            udp_port: 5600,
            tcp_port: 5601,
            beacon_interval_secs: 15,
            handshake_timeout_ms: 5000,
        }
    }
}

impl IpcSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl DiscoverySettings {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl HostConfig {
    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads the explicit file if given, else the default config file, then applies env overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => match get_default_config_file(APP_NAME) {
                Ok(p) => Self::load_from_file(&p)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Saves configuration to a file
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;

        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Write)?;
        }

        fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Env overrides: FORGE_HOST_NAME, FORGE_MODULE_DIR, FORGE_SOCKET_DIR, FORGE_UDP_PORT,
    /// FORGE_TCP_PORT, FORGE_RESPONSE_TIMEOUT_MS. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("FORGE_HOST_NAME").filter(|s| !s.is_empty()) {
            self.host_name = name;
        }
        if let Some(dir) = lookup("FORGE_MODULE_DIR") {
            self.module_directory = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FORGE_SOCKET_DIR") {
            self.socket_dir = Some(PathBuf::from(dir));
        }
        if let Some(p) = lookup("FORGE_UDP_PORT").and_then(|s| s.parse().ok()) {
            self.discovery.udp_port = p;
        }
        if let Some(p) = lookup("FORGE_TCP_PORT").and_then(|s| s.parse().ok()) {
            self.discovery.tcp_port = p;
        }
        if let Some(ms) = lookup("FORGE_RESPONSE_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.ipc.response_timeout_ms = ms;
        }
    }

    /// Socket directory, falling back to `<runtime dir>/forge` or `<tmp>/forge`
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(default_socket_dir)
    }
}

/// Default directory for endpoint sockets
pub fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Helper function to get default config directory
pub fn get_default_config_dir(app_name: &str) -> ConfigResult<PathBuf> {
    let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home_dir.join(".config").join(app_name))
}

/// Helper function to get default config file path
pub fn get_default_config_file(app_name: &str) -> ConfigResult<PathBuf> {
    let config_dir = get_default_config_dir(app_name)?;
    Ok(config_dir.join("config.toml"))
}

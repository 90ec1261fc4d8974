use async_trait::async_trait;
use forge_core::{Container, HostConfig, Module, ModuleError, ModuleState};
use forge_host::builtin::{ECHO_MODULE, PACKAGE};
use forge_host::{Host, HostError, LoaderError, PluginCatalog};
use forge_ipc::{Message, MessageKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(3));

fn host_config(root: &Path, name: &str, discovery: bool) -> HostConfig {
    let mut config = HostConfig::default();
    config.host_name = name.to_string();
    config.module_directory = root.join("modules");
    config.socket_dir = Some(root.join("sockets"));
    config.log.file = None;
    config.discovery.enabled = discovery;
    config.discovery.bind_address = "127.0.0.1".to_string();
    config.discovery.tcp_port = 0;
    config.discovery.beacon_interval_secs = 0;
    config
}

fn enable_package(config: &HostConfig, package: &str) {
    std::fs::create_dir_all(&config.module_directory).unwrap();
    std::fs::write(
        config.module_directory.join(format!("{package}.toml")),
        format!("package = \"{package}\"\n"),
    )
    .unwrap();
}

#[tokio::test]
async fn test_host_answers_commands_and_hosts_echo() {
    let root = tempfile::tempdir().unwrap();
    let config = host_config(root.path(), "local.host", false);
    enable_package(&config, PACKAGE);
    let host = Host::start(config).await.unwrap();
    let client = host.client().clone();

    let pong = client
        .send_and_wait(Message::request("local.host", "ctl", "PING"), WAIT)
        .await
        .unwrap();
    assert_eq!(pong.body, "pong");

    let modules = client
        .send_and_wait(Message::request("local.host", "ctl", "modules"), WAIT)
        .await
        .unwrap();
    let payload = modules.payload.unwrap();
    assert_eq!(payload[0]["name"], ECHO_MODULE);
    assert_eq!(payload[0]["status"], "running");

    let echoed = client
        .send_and_wait(Message::request(ECHO_MODULE, "ctl", "hello"), WAIT)
        .await
        .unwrap();
    assert_eq!(echoed.kind, MessageKind::Response);
    assert_eq!(echoed.body, "hello");

    // A stop command ends run_until_shutdown
    client.send(Message::command("local.host", "ctl", "stop")).await;
    tokio::time::timeout(Duration::from_secs(3), host.run_until_shutdown())
        .await
        .unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn test_linked_hosts_route_requests() {
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();
    let config_b = host_config(root_b.path(), "b.host", true);
    enable_package(&config_b, PACKAGE);

    let host_a = Host::start(host_config(root_a.path(), "a.host", true)).await.unwrap();
    let host_b = Host::start(config_b).await.unwrap();

    let discovery_a = host_a.discovery().unwrap();
    let discovery_b = host_b.discovery().unwrap();
    discovery_a
        .connect(discovery_b.local_addr(), "b.host")
        .await
        .unwrap();
    for _ in 0..40 {
        if discovery_b.is_connected("a.host") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(discovery_b.is_connected("a.host"));

    // Request and reply both cross the link: the reply comes back to a.host through b's
    // forwarding endpoint for a.host.
    let version = host_a
        .client()
        .send_and_wait(Message::request("b.host", "a.host", "version"), WAIT)
        .await
        .unwrap();
    assert_eq!(version.body, env!("CARGO_PKG_VERSION"));
    assert_eq!(version.from, "b.host");

    let peers = host_b
        .client()
        .send_and_wait(Message::request("b.host", "b.ctl", "peers"), WAIT)
        .await
        .unwrap();
    assert_eq!(peers.payload, Some(vec![serde_json::json!("a.host")]));

    host_a.shutdown().await;
    host_b.shutdown().await;
}

struct NeedsGhost {
    state: ModuleState,
}

#[async_trait]
impl Module for NeedsGhost {
    fn name(&self) -> &str {
        "needs.ghost"
    }
    fn version(&self) -> &str {
        "0.1.0"
    }
    fn dependencies(&self) -> Vec<String> {
        vec!["ghost".to_string()]
    }
    fn state(&self) -> &ModuleState {
        &self.state
    }
    async fn initialize(&self, _container: Arc<Container>) -> Result<(), ModuleError> {
        Ok(())
    }
    async fn stop(&self) {}
}

fn broken_package() -> Vec<Arc<dyn Module>> {
    vec![Arc::new(NeedsGhost {
        state: ModuleState::new(),
    })]
}

#[tokio::test]
async fn test_missing_dependency_aborts_start() {
    let root = tempfile::tempdir().unwrap();
    let config = host_config(root.path(), "broken.host", false);
    enable_package(&config, "test.broken");
    enable_package(&config, PACKAGE);

    let mut catalog = PluginCatalog::with_builtins();
    catalog.register("test.broken", broken_package);

    match Host::start_with_catalog(config, catalog).await {
        Err(HostError::Loader(LoaderError::MissingDependency { module, dependency })) => {
            assert_eq!(module, "needs.ghost");
            assert_eq!(dependency, "ghost");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("host started with a missing dependency"),
    }
    assert!(!root.path().join("sockets").join("broken.host.sock").exists());
}

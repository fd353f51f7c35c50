//! End-to-end tests for topology reconciliation and server lifecycle,
//! driven against an in-memory container runtime.

use async_trait::async_trait;
use craftdock::config::Config;
use craftdock::db::{Database, Status, PROXY_ID};
use craftdock::error::{Error, Result};
use craftdock::proxy::ProxyReconciler;
use craftdock::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ExecOutput, LogChunk, LogStream,
};
use craftdock::server::{CreateServerRequest, ServerManager};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    networks: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashSet<String>,
    networks: HashSet<String>,
    images: HashSet<String>,
    next_id: u64,
    /// volumes a helper container staged the forwarding patch into
    staged_patches: HashSet<String>,
    /// container id -> last routing config written via exec
    deployed_configs: HashMap<String, String>,
}

/// In-memory stand-in for the container runtime
#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
    fail_pulls: AtomicBool,
    fail_inspects: AtomicBool,
}

impl FakeRuntime {
    fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    fn has_network(&self, name: &str) -> bool {
        self.state.lock().unwrap().networks.contains(name)
    }

    fn patch_staged(&self, volume: &str) -> bool {
        self.state.lock().unwrap().staged_patches.contains(volume)
    }

    fn deployed_config(&self, container_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .deployed_configs
            .get(container_id)
            .cloned()
    }

    /// Simulate a container being removed outside the orchestrator
    fn externally_remove(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(Error::runtime("pull image", "registry unreachable"));
        }
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();

        if !spec.name.is_empty()
            && state
                .containers
                .values()
                .any(|c| c.spec.name == spec.name)
        {
            return Err(Error::runtime(
                "create container",
                format!("container name '{}' already exists", spec.name),
            ));
        }

        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);

        let networks = spec
            .network
            .as_ref()
            .map(|attachment| {
                HashMap::from([(attachment.network.clone(), attachment.aliases.clone())])
            })
            .unwrap_or_default();

        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                networks,
            },
        );

        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(Error::runtime("start container", "no such container")),
        }
    }

    async fn stop_container(&self, container_id: &str, _grace: Duration) -> Result<()> {
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.state.lock().unwrap().containers.remove(container_id);
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();

        // A helper writing into /data/patches marks its volume as patched
        let staged_volume = state.containers.get(container_id).and_then(|container| {
            let writes_patch = container
                .spec
                .cmd
                .as_ref()
                .is_some_and(|cmd| cmd.iter().any(|part| part.contains("/data/patches")));
            if writes_patch {
                container
                    .spec
                    .binds
                    .first()
                    .and_then(|bind| bind.split(':').next())
                    .map(|volume| volume.to_string())
            } else {
                None
            }
        });

        if let Some(volume) = staged_volume {
            state.staged_patches.insert(volume);
        }

        Ok(0)
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerDetails>> {
        if self.fail_inspects.load(Ordering::SeqCst) {
            return Err(Error::RuntimeUnavailable("daemon unreachable".to_string()));
        }

        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|container| ContainerDetails {
                running: container.running,
                restarting: false,
                dead: false,
                oom_killed: false,
                networks: container.networks.clone(),
            }))
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();

        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::runtime("create exec", "no such container"))?;
        if !container.running {
            return Err(Error::runtime("create exec", "container is not running"));
        }

        if cmd.first().map(String::as_str) == Some("sh")
            && cmd
                .get(2)
                .is_some_and(|script| script.contains("cat > /server/velocity.toml"))
        {
            let script = &cmd[2];
            let body = script
                .split_once('\n')
                .map(|(_, rest)| rest)
                .unwrap_or("")
                .strip_suffix("\nVELOCITYEOF")
                .unwrap_or("")
                .to_string();
            state
                .deployed_configs
                .insert(container_id.to_string(), body);
            return Ok(ExecOutput {
                exit_code: Some(0),
                output: String::new(),
            });
        }

        if cmd.first().map(String::as_str) == Some("rcon-cli") {
            return Ok(ExecOutput {
                exit_code: Some(0),
                output: format!("ran: {}", cmd[1..].join(" ")),
            });
        }

        Ok(ExecOutput {
            exit_code: Some(0),
            output: String::new(),
        })
    }

    async fn logs(
        &self,
        _container_id: &str,
        _follow: bool,
        _tail: Option<u32>,
    ) -> Result<LogStream> {
        let chunks: Vec<Result<LogChunk>> =
            vec![Ok(LogChunk::Stdout(b"[Server] Done\n".to_vec()))];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn create_volume(&self, name: &str, _labels: &HashMap<String, String>) -> Result<()> {
        self.state.lock().unwrap().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.remove(name);
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::runtime("connect container to network", "no such container"))?;

        container
            .networks
            .entry(network.to_string())
            .or_insert_with(|| aliases.to_vec());
        Ok(())
    }
}

struct Harness {
    runtime: Arc<FakeRuntime>,
    db: Arc<Database>,
    reconciler: Arc<ProxyReconciler>,
    servers: Arc<ServerManager>,
}

fn harness() -> Harness {
    let runtime = Arc::new(FakeRuntime::default());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let config = Config::default();

    let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let reconciler = Arc::new(ProxyReconciler::new(
        Arc::clone(&dyn_runtime),
        Arc::clone(&db),
        &config,
    ));
    let servers = Arc::new(ServerManager::new(
        dyn_runtime,
        Arc::clone(&db),
        Arc::clone(&reconciler),
        &config,
    ));

    Harness {
        runtime,
        db,
        reconciler,
        servers,
    }
}

fn create_req(name: &str) -> CreateServerRequest {
    CreateServerRequest {
        name: name.to_string(),
        max_players: None,
        motd: None,
        version: None,
    }
}

fn parsed_config(harness: &Harness) -> toml::Value {
    let proxy = harness.db.get_proxy(PROXY_ID).unwrap().unwrap();
    let rendered = harness
        .runtime
        .deployed_config(proxy.container_id.as_deref().unwrap())
        .expect("a routing config should have been deployed");
    toml::from_str(&rendered).expect("deployed config should be valid TOML")
}

fn try_list(config: &toml::Value) -> Vec<String> {
    config["servers"]["try"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

fn server_mapping(config: &toml::Value) -> HashMap<String, String> {
    config["servers"]
        .as_table()
        .unwrap()
        .iter()
        .filter(|(key, _)| key.as_str() != "try")
        .map(|(key, value)| (key.clone(), value.as_str().unwrap().to_string()))
        .collect()
}

#[tokio::test]
async fn ensure_proxy_is_idempotent() {
    let h = harness();

    let first = h.reconciler.ensure_proxy_exists().await.unwrap();
    let second = h.reconciler.ensure_proxy_exists().await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(second.status, Status::Running);

    // no second container or volume was provisioned
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.runtime.volume_count(), 1);
    assert!(h.runtime.has_network("minecraft-network"));
}

#[tokio::test]
async fn duplicate_server_name_conflicts_without_orphans() {
    let h = harness();

    h.servers.create_server(create_req("alpha")).await.unwrap();
    let err = h
        .servers
        .create_server(create_req("alpha"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.runtime.volume_count(), 1);
    assert_eq!(h.db.list_servers().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_image_pull_rolls_back_storage() {
    let h = harness();
    h.runtime.fail_pulls.store(true, Ordering::SeqCst);

    let err = h
        .servers
        .create_server(create_req("alpha"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RuntimeOperation { .. }));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.runtime.volume_count(), 0);
    assert!(h.db.list_servers().unwrap().is_empty());
}

#[tokio::test]
async fn deployed_config_tracks_registry_contents() {
    let h = harness();
    h.reconciler.ensure_proxy_exists().await.unwrap();

    let alpha = h.servers.create_server(create_req("alpha")).await.unwrap();
    h.servers.create_server(create_req("beta")).await.unwrap();

    h.reconciler.regenerate_config().await.unwrap();

    let mapping = server_mapping(&parsed_config(&h));
    assert_eq!(mapping.len(), 2);
    assert_eq!(mapping["alpha"], "alpha:25565");
    assert_eq!(mapping["beta"], "beta:25565");

    // deletion regenerates; the mapping shrinks to the survivors
    h.servers.delete_server(&alpha.id).await.unwrap();

    let mapping = server_mapping(&parsed_config(&h));
    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping["beta"], "beta:25565");
}

#[tokio::test]
async fn default_target_controls_try_order_and_degrades_when_dangling() {
    let h = harness();
    h.reconciler.ensure_proxy_exists().await.unwrap();

    h.servers.create_server(create_req("alpha")).await.unwrap();
    let beta = h.servers.create_server(create_req("beta")).await.unwrap();

    h.reconciler.regenerate_config().await.unwrap();
    assert_eq!(try_list(&parsed_config(&h)), vec!["alpha", "beta"]);

    h.reconciler
        .update_default_target(Some(beta.id.clone()))
        .await
        .unwrap();
    h.reconciler.regenerate_config().await.unwrap();
    assert_eq!(try_list(&parsed_config(&h)), vec!["beta"]);

    // deleting the default leaves a dangling reference, which resolves to
    // "no default" on the next regeneration
    h.servers.delete_server(&beta.id).await.unwrap();
    assert_eq!(try_list(&parsed_config(&h)), vec!["alpha"]);
}

#[tokio::test]
async fn externally_removed_container_is_detected_and_persisted() {
    let h = harness();

    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    let server = h.servers.start_server(&server.id).await.unwrap();
    assert_eq!(server.status, Status::Running);

    h.runtime
        .externally_remove(server.container_id.as_deref().unwrap());

    let synced = h.servers.get_server(&server.id).await.unwrap();
    assert_eq!(synced.status, Status::Stopped);
    assert!(synced.container_id.is_none());

    // the correction is persisted, not just reported
    let persisted = h.db.get_server(&server.id).unwrap().unwrap();
    assert_eq!(persisted.status, Status::Stopped);
    assert!(persisted.container_id.is_none());
}

#[tokio::test]
async fn sync_failure_degrades_to_last_known_state() {
    let h = harness();

    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    let server = h.servers.start_server(&server.id).await.unwrap();

    h.runtime.fail_inspects.store(true, Ordering::SeqCst);

    // the read still succeeds, returning the last persisted state
    let stale = h.servers.get_server(&server.id).await.unwrap();
    assert_eq!(stale.status, Status::Running);
    assert!(stale.container_id.is_some());
}

#[tokio::test]
async fn connect_to_shared_network_uses_name_as_sole_alias() {
    let h = harness();
    h.reconciler.ensure_proxy_exists().await.unwrap();

    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    let container_id = server.container_id.clone().unwrap();

    let container = h.runtime.container(&container_id).unwrap();
    assert_eq!(
        container.networks["minecraft-network"],
        vec!["alpha".to_string()]
    );

    // a second connect is a no-op
    h.reconciler
        .connect_server_to_network(&h.db.get_server(&server.id).unwrap().unwrap())
        .await
        .unwrap();

    let container = h.runtime.container(&container_id).unwrap();
    assert_eq!(container.networks.len(), 1);
    assert_eq!(
        container.networks["minecraft-network"],
        vec!["alpha".to_string()]
    );
}

#[tokio::test]
async fn end_to_end_create_behind_proxy() {
    let h = harness();

    // proxy first, on an empty registry
    h.reconciler.ensure_proxy_exists().await.unwrap();

    // max_players omitted, defaults to 20
    let alpha = h.servers.create_server(create_req("alpha")).await.unwrap();
    assert_eq!(alpha.max_players, 20);
    assert_eq!(alpha.motd, "Minecraft Server - alpha");

    // behind a proxy the server must trust forwarded identities
    let container = h
        .runtime
        .container(alpha.container_id.as_deref().unwrap())
        .unwrap();
    assert!(container
        .spec
        .env
        .contains(&"ONLINE_MODE=FALSE".to_string()));
    assert!(container
        .spec
        .env
        .contains(&"PATCH_DEFINITIONS=/data/patches".to_string()));

    // the startup patch was staged before first boot
    assert!(h.runtime.patch_staged(&alpha.volume_id));

    // attached to the shared network under its name
    assert_eq!(
        container.networks["minecraft-network"],
        vec!["alpha".to_string()]
    );

    h.reconciler.regenerate_config().await.unwrap();
    assert_eq!(try_list(&parsed_config(&h)), vec!["alpha"]);
}

#[tokio::test]
async fn server_without_proxy_stays_standalone() {
    let h = harness();

    let alpha = h.servers.create_server(create_req("alpha")).await.unwrap();

    let container = h
        .runtime
        .container(alpha.container_id.as_deref().unwrap())
        .unwrap();
    assert!(!container
        .spec
        .env
        .contains(&"ONLINE_MODE=FALSE".to_string()));
    assert!(!h.runtime.patch_staged(&alpha.volume_id));
}

#[tokio::test]
async fn regenerate_without_proxy_is_an_error() {
    let h = harness();
    let err = h.reconciler.regenerate_config().await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn regenerate_against_stopped_proxy_fails_deployment() {
    let h = harness();
    let proxy = h.reconciler.ensure_proxy_exists().await.unwrap();

    h.reconciler.stop_proxy().await.unwrap();

    let err = h.reconciler.regenerate_config().await.unwrap_err();
    assert!(matches!(err, Error::ConfigDeployment(_)));

    // no config was deployed
    assert!(h
        .runtime
        .deployed_config(proxy.container_id.as_deref().unwrap())
        .is_none());
}

#[tokio::test]
async fn stopped_server_remains_in_routing_config() {
    let h = harness();
    h.reconciler.ensure_proxy_exists().await.unwrap();

    let alpha = h.servers.create_server(create_req("alpha")).await.unwrap();
    h.servers.start_server(&alpha.id).await.unwrap();
    h.servers.stop_server(&alpha.id).await.unwrap();

    h.reconciler.regenerate_config().await.unwrap();

    let mapping = server_mapping(&parsed_config(&h));
    assert_eq!(mapping["alpha"], "alpha:25565");
}

#[tokio::test]
async fn lifecycle_start_stop_updates_registry() {
    let h = harness();
    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    assert_eq!(server.status, Status::Provisioning);

    let server = h.servers.start_server(&server.id).await.unwrap();
    assert_eq!(server.status, Status::Running);
    assert!(h
        .runtime
        .container(server.container_id.as_deref().unwrap())
        .unwrap()
        .running);

    let server = h.servers.stop_server(&server.id).await.unwrap();
    assert_eq!(server.status, Status::Stopped);

    let err = h.servers.start_server("missing-id").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn delete_removes_runtime_objects_and_row_last() {
    let h = harness();
    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    let container_id = server.container_id.clone().unwrap();

    h.servers.delete_server(&server.id).await.unwrap();

    assert!(h.runtime.container(&container_id).is_none());
    assert_eq!(h.runtime.volume_count(), 0);
    assert!(h.db.get_server(&server.id).unwrap().is_none());

    let err = h.servers.delete_server(&server.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn execute_command_returns_combined_output() {
    let h = harness();
    let server = h.servers.create_server(create_req("alpha")).await.unwrap();
    h.servers.start_server(&server.id).await.unwrap();

    let output = h.servers.execute_command(&server.id, "list").await.unwrap();
    assert_eq!(output, "ran: list");
}

#[tokio::test]
async fn log_stream_yields_demuxed_chunks() {
    let h = harness();
    let server = h.servers.create_server(create_req("alpha")).await.unwrap();

    let mut stream = h.servers.logs(&server.id, false, Some(10)).await.unwrap();
    let chunk = stream.next().await.unwrap().unwrap();
    match chunk {
        LogChunk::Stdout(bytes) => assert_eq!(bytes, b"[Server] Done\n"),
        LogChunk::Stderr(_) => panic!("expected stdout"),
    }
}

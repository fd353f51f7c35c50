//! Backend server lifecycle management
//!
//! Owns create/start/stop/delete for the game-server fleet and drives the
//! proxy reconciler after each mutation so network membership and routing
//! configuration stay in step with the registry.

use crate::config::Config;
use crate::db::{Database, ServerRecord, Status, PROXY_ID};
use crate::error::{Error, Result};
use crate::proxy::ProxyReconciler;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, LogStream, RestartPolicy};
use crate::status;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Patch definition staged into a server's volume before first boot so the
/// backend trusts identities forwarded by the proxy instead of
/// authenticating players itself
const FORWARDING_PATCH: &str = r#"{
  "file": "/data/spigot.yml",
  "ops": [
    {
      "$set": {
        "path": "$.settings.bungeecord",
        "value": true,
        "value-type": "bool"
      }
    }
  ]
}"#;

/// Request to create a new server
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Manages the backend server fleet
pub struct ServerManager {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    reconciler: Arc<ProxyReconciler>,
    image: String,
    helper_image: String,
    stop_grace: Duration,
    /// Serializes start/stop/delete per server id; the registry alone does
    /// not order concurrent mutations of the same row
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ServerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        reconciler: Arc<ProxyReconciler>,
        config: &Config,
    ) -> Self {
        Self {
            runtime,
            db,
            reconciler,
            image: config.images.server.clone(),
            helper_image: config.images.helper.clone(),
            stop_grace: Duration::from_secs(config.servers.stop_timeout_secs),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn require(&self, id: &str) -> Result<ServerRecord> {
        self.db
            .get_server(id)?
            .ok_or_else(|| Error::NotFound(format!("server '{}'", id)))
    }

    /// Create a server: volume, image, container, registry row, then the
    /// best-effort proxy wiring. All-or-nothing up to the registry insert.
    pub async fn create_server(&self, req: CreateServerRequest) -> Result<ServerRecord> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("server name is required".to_string()));
        }
        // the name becomes a network alias, so it must be DNS-safe
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "server name '{}' may only contain letters, digits, '-' and '_'",
                name
            )));
        }
        if self.db.get_server_by_name(&name)?.is_some() {
            return Err(Error::Conflict(format!(
                "server name '{}' is already in use",
                name
            )));
        }

        let id = Uuid::new_v4().to_string();
        let max_players = req.max_players.unwrap_or(20);
        let motd = req
            .motd
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Minecraft Server - {}", name));
        let version = req
            .version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "LATEST".to_string());

        info!(server_id = %id, name = %name, max_players, version = %version, "Creating server");

        let volume = format!("mc-server-{}", id);
        let labels = HashMap::from([
            ("craftdock-server-id".to_string(), id.clone()),
            ("craftdock-server-name".to_string(), name.clone()),
        ]);

        self.runtime.create_volume(&volume, &labels).await?;

        if let Err(e) = self.runtime.pull_image(&self.image).await {
            let _ = self.runtime.remove_volume(&volume).await;
            return Err(e);
        }

        // A proxy in the registry means the server must trust forwarded
        // player identities instead of authenticating on its own
        let has_proxy = match self.db.get_proxy(PROXY_ID) {
            Ok(proxy) => proxy.is_some(),
            Err(e) => {
                let _ = self.runtime.remove_volume(&volume).await;
                return Err(e);
            }
        };

        let mut env = vec![
            "EULA=TRUE".to_string(),
            format!("MAX_PLAYERS={}", max_players),
            format!("MOTD={}", motd),
            format!("VERSION={}", version),
            "TYPE=PAPER".to_string(),
        ];
        if has_proxy {
            env.push("ONLINE_MODE=FALSE".to_string());
            env.push("PATCH_DEFINITIONS=/data/patches".to_string());
        }

        let spec = ContainerSpec {
            name: format!("mc-server-{}", id),
            image: self.image.clone(),
            env,
            cmd: None,
            labels,
            binds: vec![format!("{}:/data", volume)],
            restart: RestartPolicy::Always,
            published_port: None,
            network: None,
        };

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(container_id) => container_id,
            Err(e) => {
                let _ = self.runtime.remove_volume(&volume).await;
                return Err(e);
            }
        };

        let record = ServerRecord {
            id: id.clone(),
            name: name.clone(),
            container_id: Some(container_id.clone()),
            volume_id: volume.clone(),
            status: Status::Provisioning,
            max_players,
            motd,
            version,
            created_at: String::new(),
            updated_at: String::new(),
        };

        if let Err(e) = self.db.create_server(&record) {
            let _ = self.runtime.remove_container(&container_id).await;
            let _ = self.runtime.remove_volume(&volume).await;
            return Err(e);
        }

        // re-read to pick up database timestamps; the row is already durable
        let record = self.db.get_server(&id).ok().flatten().unwrap_or(record);

        // The server is valid standalone from here on; proxy wiring is
        // best-effort and must not unwind the creation.
        if has_proxy {
            if let Err(e) = self.stage_forwarding_patch(&volume).await {
                warn!(server_id = %id, error = %e, "Failed to stage forwarding patch");
            }
        }

        if let Err(e) = self.reconciler.connect_server_to_network(&record).await {
            warn!(server_id = %id, error = %e, "Failed to connect server to shared network");
        }

        if has_proxy {
            if let Err(e) = self.reconciler.regenerate_config().await {
                warn!(server_id = %id, error = %e, "Failed to regenerate proxy config");
            }
        }

        info!(server_id = %id, name = %record.name, container_id = %container_id,
            "Server created");
        Ok(record)
    }

    /// Write the forwarding patch into the server's volume with a disposable
    /// helper container. Must run before the server's first start so the
    /// patch is picked up at boot.
    async fn stage_forwarding_patch(&self, volume: &str) -> Result<()> {
        self.runtime.pull_image(&self.helper_image).await?;

        let script = format!(
            "mkdir -p /data/patches && cat > /data/patches/bungeecord.json << 'PATCHEOF'\n{}\nPATCHEOF",
            FORWARDING_PATCH
        );

        let spec = ContainerSpec {
            name: String::new(),
            image: self.helper_image.clone(),
            env: Vec::new(),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            labels: HashMap::new(),
            binds: vec![format!("{}:/data", volume)],
            restart: RestartPolicy::None,
            published_port: None,
            network: None,
        };

        let helper_id = self.runtime.create_container(&spec).await?;

        let result = async {
            self.runtime.start_container(&helper_id).await?;
            self.runtime.wait_container(&helper_id).await
        }
        .await;

        let _ = self.runtime.remove_container(&helper_id).await;

        match result {
            Ok(0) => {
                debug!(volume, "Forwarding patch staged");
                Ok(())
            }
            Ok(code) => Err(Error::runtime(
                "stage forwarding patch",
                format!("helper container exited with status {}", code),
            )),
            Err(e) => Err(e),
        }
    }

    /// Return a server with its lifecycle state synced against the live
    /// container
    pub async fn get_server(&self, id: &str) -> Result<ServerRecord> {
        let mut server = self.require(id)?;
        self.sync_status(&mut server).await;
        Ok(server)
    }

    /// List all servers, each synced against its live container
    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let mut servers = self.db.list_servers()?;
        for server in &mut servers {
            self.sync_status(server).await;
        }
        Ok(servers)
    }

    async fn sync_status(&self, server: &mut ServerRecord) {
        let details = match server.container_id.as_deref() {
            Some(container_id) => match self.runtime.inspect_container(container_id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(server_id = %server.id, error = %e,
                        "State sync failed, returning last known state");
                    return;
                }
            },
            None => None,
        };

        let resolution = status::resolve(details.as_ref());
        let handle_stale = resolution.clear_handle && server.container_id.is_some();

        if resolution.status != server.status || handle_stale {
            info!(
                server_id = %server.id,
                previous = server.status.as_str(),
                current = resolution.status.as_str(),
                "Server status changed, updating database"
            );
            server.status = resolution.status;
            if resolution.clear_handle {
                server.container_id = None;
            }
            if let Err(e) = self.db.update_server(server) {
                warn!(server_id = %server.id, error = %e,
                    "Failed to persist synced server status");
            }
        }
    }

    /// Start a server's container and persist the state change
    pub async fn start_server(&self, id: &str) -> Result<ServerRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut server = self.require(id)?;
        let container_id = server.container_id.clone().ok_or_else(|| {
            Error::Validation(format!("server '{}' has no backing container", server.name))
        })?;

        self.runtime.start_container(&container_id).await?;

        server.status = Status::Running;
        self.db.update_server(&server)?;

        info!(server_id = %id, name = %server.name, "Server started");
        Ok(server)
    }

    /// Stop a server's container, allowing the workload the configured
    /// grace period to persist its world state
    pub async fn stop_server(&self, id: &str) -> Result<ServerRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut server = self.require(id)?;
        let container_id = server.container_id.clone().ok_or_else(|| {
            Error::Validation(format!("server '{}' has no backing container", server.name))
        })?;

        self.runtime
            .stop_container(&container_id, self.stop_grace)
            .await?;

        server.status = Status::Stopped;
        self.db.update_server(&server)?;

        info!(server_id = %id, name = %server.name, "Server stopped");
        Ok(server)
    }

    /// Delete a server and its resources. The registry row goes last so a
    /// crash mid-delete leaves a discoverable container, never a dangling
    /// row.
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let server = self.require(id)?;

        if let Some(container_id) = server.container_id.as_deref() {
            // already-stopped is fine here
            let _ = self.runtime.stop_container(container_id, self.stop_grace).await;
            self.runtime.remove_container(container_id).await?;
        }

        self.runtime.remove_volume(&server.volume_id).await?;
        self.db.delete_server(id)?;

        info!(server_id = %id, name = %server.name, "Server deleted");

        // Keep the deployed routing config in step with the registry
        if let Ok(Some(_)) = self.db.get_proxy(PROXY_ID) {
            if let Err(e) = self.reconciler.regenerate_config().await {
                warn!(server_id = %id, error = %e,
                    "Failed to regenerate proxy config after delete");
            }
        }

        Ok(())
    }

    /// Run a console command inside the server via the in-image rcon
    /// runner. One attempt, combined output, errors surfaced verbatim.
    pub async fn execute_command(&self, id: &str, command: &str) -> Result<String> {
        let server = self.require(id)?;
        let container_id = server.container_id.as_deref().ok_or_else(|| {
            Error::Validation(format!("server '{}' has no backing container", server.name))
        })?;

        let ExecOutput { output, .. } = self
            .runtime
            .exec(
                container_id,
                &["rcon-cli".to_string(), command.to_string()],
            )
            .await?;

        Ok(output)
    }

    /// Stream a server's demultiplexed container logs
    pub async fn logs(&self, id: &str, follow: bool, tail: Option<u32>) -> Result<LogStream> {
        let server = self.require(id)?;
        let container_id = server.container_id.as_deref().ok_or_else(|| {
            Error::Validation(format!("server '{}' has no backing container", server.name))
        })?;

        self.runtime.logs(container_id, follow, tail).await
    }
}

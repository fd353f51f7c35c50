//! Proxy topology reconciliation
//!
//! Keeps the single Velocity proxy consistent with the changing set of
//! backend servers: lazy get-or-create of the proxy, shared-network
//! membership for every backend, and regeneration of the routing
//! configuration inside the live proxy container. All three operations are
//! idempotent and independently retriable.

use crate::config::Config;
use crate::db::{Database, ProxyRecord, ServerRecord, Status, PROXY_ID};
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, NetworkAttachment, PortPublication, RestartPolicy,
};
use crate::status;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed name of the proxy container and its volume
const PROXY_CONTAINER_NAME: &str = "mc-proxy-main";
const PROXY_VOLUME: &str = "mc-proxy-main";

/// Aliases the proxy carries on the shared network
const PROXY_ALIASES: [&str; 2] = ["velocity-proxy", "proxy"];

/// Port Velocity listens on inside its container
const PROXY_INTERNAL_PORT: u16 = 25577;

/// Port backend servers listen on inside the shared network
pub const GAME_PORT: u16 = 25565;

/// Routing configuration path inside the proxy container
const PROXY_CONFIG_PATH: &str = "/server/velocity.toml";

/// Reconciles proxy-side state (existence, network membership, routing
/// config) with the registry contents
pub struct ProxyReconciler {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    network: String,
    image: String,
    host_port: u16,
    stop_grace: Duration,
}

impl ProxyReconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, db: Arc<Database>, config: &Config) -> Self {
        Self {
            runtime,
            db,
            network: config.docker.network.clone(),
            image: config.images.proxy.clone(),
            host_port: config.servers.proxy_port,
            stop_grace: Duration::from_secs(config.servers.stop_timeout_secs),
        }
    }

    /// Name of the shared network joining the proxy and all servers
    pub fn network_name(&self) -> &str {
        &self.network
    }

    /// Return the proxy row, creating and starting the proxy if absent.
    /// Safe to call repeatedly and concurrently: losing the creation race
    /// resolves to the winner's row.
    pub async fn ensure_proxy_exists(&self) -> Result<ProxyRecord> {
        if let Some(proxy) = self.db.get_proxy(PROXY_ID)? {
            debug!(proxy_id = %proxy.id, "Proxy already exists");
            return Ok(proxy);
        }

        info!("Proxy does not exist, creating");
        self.create_proxy().await
    }

    async fn create_proxy(&self) -> Result<ProxyRecord> {
        let labels = HashMap::from([("craftdock-proxy".to_string(), "main".to_string())]);

        self.runtime.create_volume(PROXY_VOLUME, &labels).await?;

        if let Err(e) = self.runtime.pull_image(&self.image).await {
            let _ = self.runtime.remove_volume(PROXY_VOLUME).await;
            return Err(e);
        }

        if let Err(e) = self.runtime.ensure_network(&self.network).await {
            let _ = self.runtime.remove_volume(PROXY_VOLUME).await;
            return Err(e);
        }

        let spec = ContainerSpec {
            name: PROXY_CONTAINER_NAME.to_string(),
            image: self.image.clone(),
            env: vec!["TYPE=VELOCITY".to_string(), "MEMORY=512M".to_string()],
            cmd: None,
            labels,
            binds: vec![format!("{}:/server", PROXY_VOLUME)],
            restart: RestartPolicy::UnlessStopped,
            published_port: Some(PortPublication {
                container_port: PROXY_INTERNAL_PORT,
                host_port: self.host_port,
            }),
            network: Some(NetworkAttachment {
                network: self.network.clone(),
                aliases: PROXY_ALIASES.iter().map(|a| a.to_string()).collect(),
            }),
        };

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let _ = self.runtime.remove_volume(PROXY_VOLUME).await;
                return Err(e);
            }
        };

        let mut record = ProxyRecord {
            id: PROXY_ID.to_string(),
            name: "Main Proxy".to_string(),
            container_id: Some(container_id.clone()),
            volume_id: PROXY_VOLUME.to_string(),
            default_server_id: None,
            status: Status::Provisioning,
            port: self.host_port,
            created_at: String::new(),
            updated_at: String::new(),
        };

        match self.db.create_proxy(&record) {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                // Someone else persisted the proxy first; discard our
                // container and defer to theirs. The volume is shared by
                // name and now belongs to the winner.
                info!("Lost proxy creation race, using existing proxy");
                let _ = self.runtime.remove_container(&container_id).await;
                return self
                    .db
                    .get_proxy(PROXY_ID)?
                    .ok_or_else(|| Error::NotFound("proxy".to_string()));
            }
            Err(e) => {
                let _ = self.runtime.remove_container(&container_id).await;
                let _ = self.runtime.remove_volume(PROXY_VOLUME).await;
                return Err(e);
            }
        }

        if let Err(e) = self.runtime.start_container(&container_id).await {
            // Unwind in reverse order of provisioning
            let _ = self.db.delete_proxy(PROXY_ID);
            let _ = self.runtime.remove_container(&container_id).await;
            let _ = self.runtime.remove_volume(PROXY_VOLUME).await;
            return Err(e);
        }

        record.status = Status::Running;
        self.db.update_proxy(&record)?;

        info!(container_id = %container_id, "Proxy created and started");
        self.db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))
    }

    /// Attach a server to the shared network under its name as the sole
    /// alias. A no-op when the server is already attached.
    pub async fn connect_server_to_network(&self, server: &ServerRecord) -> Result<()> {
        self.runtime.ensure_network(&self.network).await?;

        let container_id = server.container_id.as_deref().ok_or_else(|| {
            Error::Validation(format!("server '{}' has no backing container", server.name))
        })?;

        let details = self
            .runtime
            .inspect_container(container_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("container for server '{}'", server.name)))?;

        if details.networks.contains_key(&self.network) {
            debug!(server = %server.name, network = %self.network, "Server already connected");
            return Ok(());
        }

        self.runtime
            .connect_network(&self.network, container_id, &[server.name.clone()])
            .await?;

        info!(server = %server.name, network = %self.network, "Connected server to shared network");
        Ok(())
    }

    /// Regenerate the routing configuration from the current registry
    /// contents and deploy it into the running proxy container.
    pub async fn regenerate_config(&self) -> Result<()> {
        let proxy = self
            .db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))?;

        let servers = self.db.list_servers()?;

        // A default target pointing at a deleted server degrades to unset;
        // a stopped-but-existing target remains the default.
        let default_name = match proxy.default_server_id.as_deref() {
            Some(id) => self.db.get_server(id)?.map(|s| s.name),
            None => None,
        };

        let rendered = render_routing_config(&servers, default_name.as_deref());

        let container_id = proxy.container_id.as_deref().ok_or_else(|| {
            Error::ConfigDeployment("proxy has no backing container".to_string())
        })?;

        self.deploy_config(container_id, &rendered).await?;

        info!(
            servers = servers.len(),
            default = default_name.as_deref().unwrap_or("<none>"),
            "Deployed routing configuration"
        );
        Ok(())
    }

    /// Write the rendered configuration into the proxy container via exec
    async fn deploy_config(&self, container_id: &str, rendered: &str) -> Result<()> {
        let script = format!(
            "cat > {} << 'VELOCITYEOF'\n{}\nVELOCITYEOF",
            PROXY_CONFIG_PATH, rendered
        );

        let result = self
            .runtime
            .exec(
                container_id,
                &["sh".to_string(), "-c".to_string(), script],
            )
            .await
            .map_err(|e| Error::ConfigDeployment(e.to_string()))?;

        match result.exit_code {
            Some(0) => Ok(()),
            code => Err(Error::ConfigDeployment(format!(
                "config write exited with {:?}: {}",
                code,
                result.output.trim()
            ))),
        }
    }

    /// Return the proxy row with its lifecycle state synced against the
    /// live container. A sync failure degrades to the last-persisted state.
    pub async fn get_proxy(&self) -> Result<ProxyRecord> {
        let mut proxy = self
            .db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))?;

        self.sync_status(&mut proxy).await;
        Ok(proxy)
    }

    async fn sync_status(&self, proxy: &mut ProxyRecord) {
        let details = match proxy.container_id.as_deref() {
            Some(container_id) => match self.runtime.inspect_container(container_id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(proxy_id = %proxy.id, error = %e,
                        "State sync failed, returning last known state");
                    return;
                }
            },
            None => None,
        };

        let resolution = status::resolve(details.as_ref());
        let handle_stale = resolution.clear_handle && proxy.container_id.is_some();

        if resolution.status != proxy.status || handle_stale {
            info!(
                proxy_id = %proxy.id,
                previous = proxy.status.as_str(),
                current = resolution.status.as_str(),
                "Proxy status changed, updating database"
            );
            proxy.status = resolution.status;
            if resolution.clear_handle {
                proxy.container_id = None;
            }
            if let Err(e) = self.db.update_proxy(proxy) {
                warn!(proxy_id = %proxy.id, error = %e, "Failed to persist synced proxy status");
            }
        }
    }

    /// Point first-time connections at a server, or clear the default.
    /// The reference is allowed to dangle; it resolves to "no default" at
    /// config-generation time.
    pub async fn update_default_target(
        &self,
        default_server_id: Option<String>,
    ) -> Result<ProxyRecord> {
        let mut proxy = self
            .db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))?;

        proxy.default_server_id = default_server_id.filter(|id| !id.is_empty());
        self.db.update_proxy(&proxy)?;

        info!(
            proxy_id = %proxy.id,
            default_server_id = proxy.default_server_id.as_deref().unwrap_or("<none>"),
            "Updated proxy default target"
        );

        self.db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))
    }

    /// Start the proxy container and persist the state change
    pub async fn start_proxy(&self) -> Result<ProxyRecord> {
        let mut proxy = self
            .db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))?;

        let container_id = proxy.container_id.clone().ok_or_else(|| {
            Error::Validation("proxy has no backing container".to_string())
        })?;

        self.runtime.start_container(&container_id).await?;

        proxy.status = Status::Running;
        self.db.update_proxy(&proxy)?;

        info!(proxy_id = %proxy.id, container_id = %container_id, "Proxy started");
        Ok(proxy)
    }

    /// Stop the proxy container and persist the state change
    pub async fn stop_proxy(&self) -> Result<ProxyRecord> {
        let mut proxy = self
            .db
            .get_proxy(PROXY_ID)?
            .ok_or_else(|| Error::NotFound("proxy".to_string()))?;

        let container_id = proxy.container_id.clone().ok_or_else(|| {
            Error::Validation("proxy has no backing container".to_string())
        })?;

        self.runtime
            .stop_container(&container_id, self.stop_grace)
            .await?;

        proxy.status = Status::Stopped;
        self.db.update_proxy(&proxy)?;

        info!(proxy_id = %proxy.id, container_id = %container_id, "Proxy stopped");
        Ok(proxy)
    }
}

/// Render the Velocity routing configuration.
///
/// Each server is addressed by its network alias on the shared network,
/// never through the host. The `try` order is the default target alone when
/// one is set, otherwise every server in registry order.
pub fn render_routing_config(servers: &[ServerRecord], default_server: Option<&str>) -> String {
    let mut server_entries = String::new();
    let mut try_list = Vec::new();

    for server in servers {
        server_entries.push_str(&format!(
            "\n{} = \"{}:{}\"",
            server.name, server.name, GAME_PORT
        ));
        try_list.push(format!("\"{}\"", server.name));
    }

    let try_value = match default_server {
        Some(name) => format!("\"{}\"", name),
        None => try_list.join(", "),
    };

    format!(
        r#"# Velocity Configuration
# Auto-generated by craftdock

config-version = "2.7"

bind = "0.0.0.0:{bind_port}"
motd = "<aqua>Minecraft Server Network</aqua>"
show-max-players = 500
online-mode = true
force-key-authentication = false

# Player information forwarding settings
player-info-forwarding-mode = "legacy"

[servers]{servers}

try = [{try_value}]

[forced-hosts]

[advanced]
compression-threshold = 256
compression-level = -1
login-ratelimit = 3000
connection-timeout = 5000
read-timeout = 30000

[query]
enabled = false
"#,
        bind_port = PROXY_INTERNAL_PORT,
        servers = server_entries,
        try_value = try_value,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ServerRecord {
        ServerRecord {
            id: format!("id-{}", name),
            name: name.to_string(),
            container_id: Some(format!("ctr-{}", name)),
            volume_id: format!("mc-server-{}", name),
            status: Status::Running,
            max_players: 20,
            motd: String::new(),
            version: "LATEST".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_render_maps_servers_to_internal_port() {
        let rendered = render_routing_config(&[record("alpha"), record("beta")], None);

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        let servers = parsed["servers"].as_table().unwrap();
        assert_eq!(servers["alpha"].as_str().unwrap(), "alpha:25565");
        assert_eq!(servers["beta"].as_str().unwrap(), "beta:25565");
        // the servers table holds exactly the two entries plus the try list
        assert_eq!(servers.len(), 3);
    }

    #[test]
    fn test_render_try_list_without_default() {
        let rendered = render_routing_config(&[record("alpha"), record("beta")], None);

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        let try_list: Vec<&str> = parsed["servers"]["try"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(try_list, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_render_try_list_with_default() {
        let rendered =
            render_routing_config(&[record("alpha"), record("beta")], Some("beta"));

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        let try_list: Vec<&str> = parsed["servers"]["try"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(try_list, vec!["beta"]);

        // every server stays routable even when a default is set
        let servers = parsed["servers"].as_table().unwrap();
        assert!(servers.contains_key("alpha"));
        assert!(servers.contains_key("beta"));
    }

    #[test]
    fn test_render_empty_registry() {
        let rendered = render_routing_config(&[], None);

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        let servers = parsed["servers"].as_table().unwrap();
        assert!(servers["try"].as_array().unwrap().is_empty());
        assert_eq!(servers.len(), 1);
        assert_eq!(parsed["bind"].as_str().unwrap(), "0.0.0.0:25577");
    }

    #[test]
    fn test_render_keeps_stopped_servers_listed() {
        let mut stopped = record("gamma");
        stopped.status = Status::Stopped;
        let rendered = render_routing_config(&[stopped], None);

        let parsed: toml::Value = toml::from_str(&rendered).unwrap();
        assert!(parsed["servers"].as_table().unwrap().contains_key("gamma"));
    }
}

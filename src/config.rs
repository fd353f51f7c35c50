//! TOML configuration for the orchestration daemon

use serde::Deserialize;
use std::path::Path;

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Management API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Container runtime settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Container images used for provisioning
    #[serde(default)]
    pub images: ImageConfig,

    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Server lifecycle defaults
    #[serde(default)]
    pub servers: ServerDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host override, e.g. "unix:///var/run/docker.sock" or "tcp://host:2375".
    /// Falls back to DOCKER_HOST and then to common socket paths.
    pub host: Option<String>,

    /// Name of the shared bridge network joining the proxy and all servers
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    /// Image for backend game servers
    #[serde(default = "default_server_image")]
    pub server: String,

    /// Image for the Velocity proxy
    #[serde(default = "default_proxy_image")]
    pub proxy: String,

    /// Image for disposable helper containers that write into volumes
    #[serde(default = "default_helper_image")]
    pub helper: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerDefaults {
    /// Grace period in seconds given to a container on stop (default: 30)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Host port the proxy publishes for player connections (default: 25565)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_network() -> String {
    "minecraft-network".to_string()
}

fn default_server_image() -> String {
    "itzg/minecraft-server:latest".to_string()
}

fn default_proxy_image() -> String {
    "itzg/bungeecord:latest".to_string()
}

fn default_helper_image() -> String {
    "alpine:latest".to_string()
}

fn default_database_path() -> String {
    "./data/craftdock.db".to_string()
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_proxy_port() -> u16 {
    25565
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: default_network(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            server: default_server_image(),
            proxy: default_proxy_image(),
            helper: default_helper_image(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
            proxy_port: default_proxy_port(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.docker.network.is_empty() {
            anyhow::bail!("docker.network must not be empty");
        }
        if self.database.path.is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.bind, "0.0.0.0");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.docker.network, "minecraft-network");
        assert_eq!(config.images.server, "itzg/minecraft-server:latest");
        assert_eq!(config.images.proxy, "itzg/bungeecord:latest");
        assert_eq!(config.servers.stop_timeout_secs, 30);
        assert_eq!(config.servers.proxy_port, 25565);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [api]
            port = 9090

            [docker]
            network = "mc-net"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.bind, "0.0.0.0");
        assert_eq!(config.docker.network, "mc-net");
        assert_eq!(config.database.path, "./data/craftdock.db");
    }

    #[test]
    fn test_validate_rejects_empty_network() {
        let config: Config = toml::from_str(
            r#"
            [docker]
            network = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

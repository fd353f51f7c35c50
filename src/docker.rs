//! Docker implementation of the container runtime capability interface

use crate::error::{Error, Result};
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ExecOutput, LogChunk, LogStream,
    PortPublication, RestartPolicy,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Talks to the Docker daemon via bollard
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>) -> Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults().await?
        };

        // Verify connection
        client.ping().await.map_err(|e| {
            Error::RuntimeUnavailable(format!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            ))
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| {
                    Error::RuntimeUnavailable(format!(
                        "cannot connect to Unix socket '{}': {}",
                        socket_path, e
                    ))
                },
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                Error::RuntimeUnavailable(format!(
                    "cannot connect to TCP endpoint '{}': {}",
                    host, e
                ))
            })
        } else {
            Err(Error::RuntimeUnavailable(format!(
                "invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    async fn connect_with_defaults() -> Result<Docker> {
        // Try common socket paths
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        // Fall back to bollard's default
        Docker::connect_with_socket_defaults().map_err(|e| {
            Error::RuntimeUnavailable(format!(
                "cannot connect to Docker daemon. Start dockerd or set DOCKER_HOST. \
                 Underlying error: {}",
                e
            ))
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        // Check if image exists locally first
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = progress.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        return Err(Error::runtime(
                            "pull image",
                            format!(
                                "image '{}' not found in registry; check the name and tag",
                                image
                            ),
                        ));
                    }
                    return Err(Error::runtime("pull image", e));
                }
            }
        }

        if let Some(error) = last_error {
            return Err(Error::runtime("pull image", error));
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        // Build port bindings
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        if let Some(PortPublication {
            container_port,
            host_port,
        }) = spec.published_port
        {
            let port_key = format!("{}/tcp", container_port);
            port_bindings.insert(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            exposed_ports.insert(port_key, HashMap::new());
        }

        let restart_policy = match spec.restart {
            RestartPolicy::None => None,
            RestartPolicy::Always => Some(DockerRestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            RestartPolicy::UnlessStopped => Some(DockerRestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
        };

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy,
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|attachment| NetworkingConfig {
            endpoints_config: HashMap::from([(
                attachment.network.clone(),
                EndpointSettings {
                    aliases: Some(attachment.aliases.clone()),
                    ..Default::default()
                },
            )]),
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = (!spec.name.is_empty()).then(|| CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let response = self
            .client
            .create_container(options, config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    Error::runtime(
                        "create container",
                        "the published port is already in use by another container or process",
                    )
                } else if err_str.contains("Conflict") && err_str.contains("name") {
                    Error::runtime(
                        "create container",
                        format!("container name '{}' already exists", spec.name),
                    )
                } else {
                    Error::runtime("create container", e)
                }
            })?;

        debug!(
            container_id = %response.id,
            name = %spec.name,
            image = %spec.image,
            "Created container"
        );

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::runtime("start container", e))?;
        info!(container_id, "Started container");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(Error::runtime("stop container", e)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(Error::runtime("remove container", e)),
        }
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard surfaces a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::runtime("wait for container", e)),
            None => Ok(0),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerDetails>> {
        let info = match self.client.inspect_container(container_id, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(Error::runtime("inspect container", e)),
        };

        let state = info.state.unwrap_or_default();
        let networks = info
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| {
                networks
                    .into_iter()
                    .map(|(name, endpoint)| (name, endpoint.aliases.unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(ContainerDetails {
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            dead: state.dead.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            networks,
        }))
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::runtime("create exec", e))?;

        let mut output = String::new();
        match self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| Error::runtime("start exec", e))?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                        Err(e) => return Err(Error::runtime("read exec output", e)),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::runtime("inspect exec", e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn logs(
        &self,
        container_id: &str,
        follow: bool,
        tail: Option<u32>,
    ) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let stream = self
            .client
            .logs(container_id, Some(options))
            .map(|item| match item {
                Ok(LogOutput::StdErr { message }) => Ok(LogChunk::Stderr(message.to_vec())),
                // console output shows up when the container allocated a TTY
                Ok(output) => Ok(LogChunk::Stdout(output.into_bytes().to_vec())),
                Err(e) => Err(Error::runtime("read container logs", e)),
            });

        Ok(Box::pin(stream))
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.client
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::runtime("create volume", e))?;
        debug!(volume = name, "Created volume");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(_) => {
                debug!(volume = name, "Removed volume");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(volume = name, "Volume not found");
                Ok(())
            }
            Err(e) => Err(Error::runtime("remove volume", e)),
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| Error::runtime("list networks", e))?;

        if networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name))
        {
            return Ok(());
        }

        match self
            .client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => {
                info!(network = name, "Created shared network");
                Ok(())
            }
            // another caller created it between the list and the create
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(Error::runtime("create network", e)),
        }
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<()> {
        match self
            .client
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(aliases.to_vec()),
                        ..Default::default()
                    },
                },
            )
            .await
        {
            Ok(_) => {
                debug!(network, container_id, "Connected container to network");
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                debug!(network, container_id, "Container already connected");
                Ok(())
            }
            Err(e) => {
                warn!(network, container_id, error = %e, "Failed to connect container to network");
                Err(Error::runtime("connect container to network", e))
            }
        }
    }
}

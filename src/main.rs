use craftdock::api::ApiServer;
use craftdock::config::Config;
use craftdock::db::Database;
use craftdock::docker::DockerRuntime;
use craftdock::proxy::ProxyReconciler;
use craftdock::runtime::ContainerRuntime;
use craftdock::server::ServerManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("craftdock=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("craftdock.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    info!(
        bind = %config.api.bind,
        port = config.api.port,
        network = %config.docker.network,
        server_image = %config.images.server,
        proxy_image = %config.images.proxy,
        database = %config.database.path,
        "Starting craftdock"
    );

    // Connect to the container runtime
    let runtime = DockerRuntime::new(config.docker.host.as_deref()).await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    info!("Container runtime connected");

    // Open the registry database
    let db = Arc::new(Database::open(&config.database.path)?);

    // Wire the reconciler and the lifecycle controller
    let reconciler = Arc::new(ProxyReconciler::new(
        Arc::clone(&runtime),
        Arc::clone(&db),
        &config,
    ));
    let servers = Arc::new(ServerManager::new(
        runtime,
        db,
        Arc::clone(&reconciler),
        &config,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.api.bind, port = config.api.port, error = %e,
                "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let api = Arc::new(ApiServer::new(addr, servers, reconciler, shutdown_rx));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Management API error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the API server to drain
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

//! CLI wrapper around `llamactl_core`, grounded in the teacher's
//! `src/main.rs` / `src/bin/paas.rs` split: one library crate, two thin
//! binaries. Loads configuration, wires the registry/activator/proxy/
//! download engine together, and drives graceful shutdown on SIGINT/SIGTERM.
//!
//! TLS/ACME, the PID file, and SIGHUP config reload are dropped — out of
//! spec.md's scope (see SPEC_FULL.md §11).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use llamactl_core::activator::Activator;
use llamactl_core::api::Dispatcher;
use llamactl_core::config::Config;
use llamactl_core::docker::DockerManager;
use llamactl_core::download::DownloadEngine;
use llamactl_core::proxy::ProxyServer;
use llamactl_core::registry::Registry;
use llamactl_core::store::{InMemoryInstanceStore, SqliteInstanceStore};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_PORT_RANGE_INVALID: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("llamactl_core=debug".parse().expect("valid log directive")),
        )
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(exit_code) => return exit_code,
    };
    let config = Arc::new(config);

    info!(path = %config_path, "configuration loaded");

    let bind_addr = bind_addr();
    let db_path = std::env::var("LLAMACTL_DB_PATH").ok();

    let store: Arc<dyn llamactl_core::store::InstanceStore> = match db_path {
        Some(path) => match SqliteInstanceStore::open(&path) {
            Ok(store) => {
                info!(path = %path, "using sqlite instance store");
                Arc::new(store)
            }
            Err(e) => {
                error!(path = %path, error = %e, "failed to open instance store");
                return EXIT_CONFIG_INVALID;
            }
        },
        None => {
            info!("LLAMACTL_DB_PATH not set, using in-memory instance store");
            Arc::new(InMemoryInstanceStore::new())
        }
    };

    let docker_host = std::env::var("LLAMACTL_DOCKER_HOST").ok();
    let docker_enabled = config.backends.values().any(|b| b.docker.enabled);
    let docker = if docker_enabled {
        match DockerManager::new(docker_host.as_deref()).await {
            Ok(manager) => Some(Arc::new(manager)),
            Err(e) => {
                error!(error = %e, "failed to connect to docker, docker-backed instances will be unavailable");
                None
            }
        }
    } else {
        None
    };

    let registry = Arc::new(Registry::new(Arc::clone(&config), store, docker));
    if let Err(e) = registry.load().await {
        error!(error = %e, "failed to load persisted instances");
        return EXIT_CONFIG_INVALID;
    }

    let activator = Arc::new(Activator::new(Arc::clone(&registry)));

    let cache_dir = PathBuf::from(&config.cache_dir.cache_dir);
    let downloads = Arc::new(DownloadEngine::new(cache_dir, env!("CARGO_PKG_VERSION")));
    downloads.spawn_janitor();

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config), Arc::clone(&downloads)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::clone(&registry),
        Arc::clone(&activator),
        dispatcher,
        shutdown_rx,
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);

    registry.shutdown_all().await;

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), proxy_handle).await;

    EXIT_OK
}

fn load_config(path: &str) -> Result<Config, i32> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            error!(path = %path, error = %e, "failed to read config file");
            return Err(EXIT_CONFIG_INVALID);
        }
    };
    let config: Config = match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path, error = %e, "failed to parse config file");
            return Err(EXIT_CONFIG_INVALID);
        }
    };
    if let Err(e) = config.validate_port_range() {
        error!(path = %path, error = %e, "invalid port range");
        return Err(EXIT_PORT_RANGE_INVALID);
    }
    if let Err(e) = config.validate() {
        error!(path = %path, error = %e, "invalid configuration");
        return Err(EXIT_CONFIG_INVALID);
    }
    Ok(config)
}

fn bind_addr() -> SocketAddr {
    std::env::var("LLAMACTL_BIND_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}

use rpcgate::cluster::ShellCommandControl;
use rpcgate::config::Config;
use rpcgate::forward::{Forwarder, PoolConfig};
use rpcgate::lifecycle::{LifecycleController, LifecycleSettings};
use rpcgate::probe::HealthProbe;
use rpcgate::proxy::ProxyRoute;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Version information for the proxy
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Config file read when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "rpcgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rpcgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // An explicit path must exist; the default one is optional
    let (config_path, required) = match std::env::args().nth(1) {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let config = Config::load(&config_path, required).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The write route's backend decides whether the cluster is ready
    let probe = HealthProbe::new(
        config.server.shared_secret().map(String::from),
        config.lifecycle.probe_timeout(),
    )
    .for_port(config.routes.write.target_port);

    let control = ShellCommandControl::new(config.cluster.start_argv()?, config.cluster.stop_argv()?);

    let lifecycle = LifecycleController::new(
        Arc::new(control),
        Arc::new(probe),
        LifecycleSettings::from(&config.lifecycle),
    );

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let forwarder = Arc::new(Forwarder::new(pool_config, config.server.shared_secret())?);

    let listen_ip: IpAddr = config.server.listen_host.parse().map_err(|e| {
        error!(listen_host = %config.server.listen_host, error = %e, "Invalid listen address");
        anyhow::anyhow!("Invalid listen address '{}': {}", config.server.listen_host, e)
    })?;

    let mut route_handles = Vec::new();
    for (name, route) in [("write", config.routes.write), ("read", config.routes.read)] {
        let proxy = ProxyRoute::new(
            name,
            SocketAddr::new(listen_ip, route.listen_port),
            route.target_port,
            Arc::clone(&lifecycle),
            Arc::clone(&forwarder),
            shutdown_rx.clone(),
        );

        route_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(route = name, error = %e, "Proxy route error");
            }
        }));
    }

    // Spawn idle shutdown task
    let idle_handle = tokio::spawn(
        Arc::clone(&lifecycle).run_idle_loop(config.lifecycle.idle_check_interval(), shutdown_rx.clone()),
    );

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if config.lifecycle.stop_on_exit {
        info!("Stopping cluster before exit...");
        if !lifecycle.stop_if_up().await {
            info!("Cluster was not up, nothing to stop");
        }
    }

    // Wait for routes to stop (with timeout)
    let joined = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in route_handles {
            let _ = handle.await;
        }
        let _ = idle_handle.await;
    })
    .await;
    if joined.is_err() {
        warn!("Timed out waiting for routes to stop");
    }

    let stats = lifecycle.stats();
    let forwarded = forwarder.stats();
    info!(
        state = ?lifecycle.state(),
        start_commands = stats.start_commands(),
        stop_commands = stats.stop_commands(),
        stop_failures = stats.stop_failures(),
        startup_failures = stats.startup_failures(),
        forwarded = forwarded.get_total_requests(),
        forward_failures = forwarded.get_failures(),
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for Ctrl+C or (on Unix) SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting on-demand RPC proxy");
    info!(
        listen_host = %config.server.listen_host,
        write_port = config.routes.write.listen_port,
        write_target_port = config.routes.write.target_port,
        read_port = config.routes.read.listen_port,
        read_target_port = config.routes.read.target_port,
        shared_secret = config.server.shared_secret().is_some(),
        "Route configuration"
    );
    info!(
        idle_seconds = config.lifecycle.idle_seconds,
        startup_timeout_ms = config.lifecycle.startup_timeout_ms,
        probe_interval_ms = config.lifecycle.probe_interval_ms,
        probe_timeout_ms = config.lifecycle.probe_timeout_ms,
        idle_check_interval_ms = config.lifecycle.idle_check_interval_ms,
        stop_on_exit = config.lifecycle.stop_on_exit,
        "Lifecycle settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    if let (Ok(start), Ok(stop)) = (config.cluster.start_argv(), config.cluster.stop_argv()) {
        info!(
            start = %shell_words::join(&start),
            stop = %shell_words::join(&stop),
            "Cluster commands"
        );
    }
}

//! pathpin - Entry Point
//!
//! Waits for the egress path, runs the proxy on it, restarts the proxy when
//! the path is lost and comes back, and stops on Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pathpin::config::{Config, LogConfig};
use pathpin::proxy::{
    PathBinding, PathProvider, PathRegistry, PathResolver, ProxyServer, SocketBinder,
};
use pathpin::services::{
    list_interfaces, local_edge_address, InterfaceMonitor, InterfaceMonitorConfig,
    InterfaceMonitorHandle,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting pathpin proxy");

    let registry = Arc::new(PathRegistry::new());

    // Start the interface monitor, or publish a fixed source-address path
    let (monitor_handle, monitor_shutdown) = InterfaceMonitorHandle::new();
    let monitor_task = match (&config.egress.interface, config.egress.source_addr) {
        (Some(interface), source_addr) => {
            if source_addr.is_some() {
                warn!("EGRESS_SOURCE_ADDR is ignored while EGRESS_INTERFACE is set");
            }
            let monitor = InterfaceMonitor::new(
                InterfaceMonitorConfig {
                    interface: interface.clone(),
                    poll_interval: config.egress.poll_interval,
                },
                registry.clone(),
            );
            Some(tokio::spawn(async move {
                monitor.run(monitor_shutdown).await;
            }))
        }
        (None, Some(addr)) => {
            registry.publish(PathBinding::source(addr));
            None
        }
        (None, None) => anyhow::bail!("No egress interface or source address configured"),
    };

    log_local_edge(&config);

    let resolver = PathResolver::new(config.egress.dns_servers.clone(), config.egress.dns_timeout);
    let binder = SocketBinder::new().with_resolver(resolver);
    let server = ProxyServer::new(config.proxy.clone(), Arc::new(binder));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        info!("Waiting for egress path");
        let path = tokio::select! {
            acquired = registry.acquire() => acquired?,
            _ = &mut shutdown => break,
        };

        let handle = match server.start(path.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                registry.release(path);
                return Err(e).context("Failed to start proxy server");
            }
        };

        info!(
            "Proxy active on {} via egress path {}",
            handle.local_addr(),
            handle.path().binding()
        );

        let stop_for_good = tokio::select! {
            _ = path.lost() => false,
            _ = &mut shutdown => true,
        };

        handle.stop().await;
        registry.release(path);

        if stop_for_good {
            break;
        }
        warn!("Egress path lost; proxy stopped until it returns");
    }

    info!("Shutdown signal received");
    monitor_handle.shutdown();
    if let Some(task) = monitor_task {
        let _ = task.await;
    }

    info!("pathpin stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pathpin={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Tell the operator which address clients on the local edge should use
fn log_local_edge(config: &Config) {
    let hint = &config.local_edge.interface_hint;
    match list_interfaces().map(|interfaces| local_edge_address(&interfaces, hint)) {
        Ok(Some(ip)) => info!("Clients should use proxy {}:{}", ip, config.proxy.port),
        Ok(None) => warn!(
            "No IPv4 address found on an interface matching '{}'; clients may not reach the proxy",
            hint
        ),
        Err(e) => warn!("Could not determine local edge address: {}", e),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! Egress interface monitor
//!
//! Polls the host's interface table and keeps a [`PathRegistry`] in step with
//! the configured egress interface: a path is published while the interface is
//! up with a usable address and invalidated as soon as that stops being true.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::proxy::path::{PathBinding, PathRegistry};
use crate::services::interfaces::{egress_address, list_interfaces};

/// Interface monitor configuration
#[derive(Clone, Debug)]
pub struct InterfaceMonitorConfig {
    /// Interface whose availability defines the egress path
    pub interface: String,
    /// How often the interface table is read
    pub poll_interval: Duration,
}

/// Publishes and invalidates egress paths as the interface comes and goes
pub struct InterfaceMonitor {
    config: InterfaceMonitorConfig,
    registry: Arc<PathRegistry>,
}

impl InterfaceMonitor {
    pub fn new(config: InterfaceMonitorConfig, registry: Arc<PathRegistry>) -> Self {
        Self { config, registry }
    }

    /// Run the monitor (call in a spawned task)
    #[instrument(skip_all, fields(interface = %self.config.interface))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watching egress interface every {}ms",
            self.config.poll_interval.as_millis()
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current: Option<IpAddr> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match list_interfaces() {
                        Ok(interfaces) => {
                            let observed = egress_address(&interfaces, &self.config.interface);
                            self.apply(observed, &mut current);
                        }
                        Err(e) => warn!("Interface poll failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Interface monitor shutting down");
                        break;
                    }
                }
            }
        }

        if current.is_some() {
            self.registry.invalidate();
        }
    }

    /// Reconcile the registry with one observation
    fn apply(&self, observed: Option<IpAddr>, current: &mut Option<IpAddr>) {
        if observed == *current {
            return;
        }

        match observed {
            Some(addr) => {
                if current.is_some() {
                    debug!(%addr, "Egress interface address changed");
                }
                let binding = PathBinding::interface(self.config.interface.clone()).with_local_addr(addr);
                self.registry.publish(binding);
            }
            None => self.registry.invalidate(),
        }

        *current = observed;
    }
}

/// Handle for stopping the interface monitor
pub struct InterfaceMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl InterfaceMonitorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for InterfaceMonitorHandle {
    fn default() -> Self {
        Self::new().0
    }
}

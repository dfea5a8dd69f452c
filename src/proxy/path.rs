//! Egress network paths
//!
//! An [`EgressPath`] names the route that outbound sockets must use. Paths are
//! handed out by a [`PathProvider`]; each one carries a loss signal that the
//! provider fires once the underlying network goes away. A lost path never
//! comes back: when the network reappears the provider publishes a new path.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PathError;

/// How outbound sockets are pinned to a path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathBinding {
    /// Interface name for `SO_BINDTODEVICE`
    pub interface: Option<String>,
    /// Local source address to bind before connecting
    pub local_addr: Option<IpAddr>,
}

impl PathBinding {
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            interface: Some(name.into()),
            local_addr: None,
        }
    }

    pub fn source(addr: IpAddr) -> Self {
        Self {
            interface: None,
            local_addr: Some(addr),
        }
    }

    pub fn with_local_addr(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Whether sockets built from this binding are tied to anything at all
    pub fn is_pinned(&self) -> bool {
        self.interface.is_some() || self.local_addr.is_some()
    }
}

impl fmt::Display for PathBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.interface, &self.local_addr) {
            (Some(iface), Some(addr)) => write!(f, "{} ({})", iface, addr),
            (Some(iface), None) => write!(f, "{}", iface),
            (None, Some(addr)) => write!(f, "{}", addr),
            (None, None) => write!(f, "<unbound>"),
        }
    }
}

/// Handle to one network path. Cheap to clone.
#[derive(Clone)]
pub struct EgressPath {
    inner: Arc<PathInner>,
}

struct PathInner {
    id: u64,
    binding: PathBinding,
    alive: watch::Receiver<bool>,
}

impl EgressPath {
    /// Create a path and the sender that controls its liveness
    pub fn new(id: u64, binding: PathBinding) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(true);
        let path = Self {
            inner: Arc::new(PathInner {
                id,
                binding,
                alive: rx,
            }),
        };
        (path, tx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn binding(&self) -> &PathBinding {
        &self.inner.binding
    }

    /// False once the provider has reported the path lost
    pub fn is_available(&self) -> bool {
        // A dropped sender means the provider is gone; treat as lost.
        *self.inner.alive.borrow() && self.inner.alive.has_changed().is_ok()
    }

    /// Subscribe to this path's loss signal
    pub fn loss_signal(&self) -> PathLoss {
        PathLoss {
            alive: self.inner.alive.clone(),
        }
    }

    /// Resolves once the path is lost
    pub async fn lost(&self) {
        self.loss_signal().wait().await
    }
}

impl fmt::Debug for EgressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressPath")
            .field("id", &self.inner.id)
            .field("binding", &self.inner.binding)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Owned subscription to a path's loss signal
#[derive(Clone)]
pub struct PathLoss {
    alive: watch::Receiver<bool>,
}

impl PathLoss {
    /// Resolves once the path is lost or its provider is dropped
    pub async fn wait(mut self) {
        let _ = self.alive.wait_for(|alive| !*alive).await;
    }
}

/// Source of egress paths
///
/// Implementations own the actual network selection. The proxy only borrows
/// the paths they hand out.
#[async_trait]
pub trait PathProvider: Send + Sync {
    /// Wait until a usable path exists
    async fn acquire(&self) -> Result<EgressPath, PathError>;

    /// Give back a path obtained from `acquire`
    fn release(&self, path: EgressPath);
}

/// In-process path provider
///
/// Whatever watches the network calls [`publish`](Self::publish) when a usable
/// path appears and [`invalidate`](Self::invalidate) when it is lost.
pub struct PathRegistry {
    current: watch::Sender<Option<EgressPath>>,
    liveness: Mutex<Option<watch::Sender<bool>>>,
    next_id: AtomicU64,
    leases: AtomicUsize,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRegistry {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            liveness: Mutex::new(None),
            next_id: AtomicU64::new(1),
            leases: AtomicUsize::new(0),
        }
    }

    /// Make a new path current. Any previous path is invalidated first.
    pub fn publish(&self, binding: PathBinding) -> EgressPath {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (path, alive) = EgressPath::new(id, binding);

        let previous = self.liveness.lock().replace(alive);
        if let Some(previous) = previous {
            previous.send_replace(false);
        }
        self.current.send_replace(Some(path.clone()));

        info!(path_id = id, binding = %path.binding(), "Egress path available");
        path
    }

    /// Report the current path lost
    pub fn invalidate(&self) {
        let previous = self.liveness.lock().take();
        let lost = self.current.send_replace(None);

        if let Some(alive) = previous {
            alive.send_replace(false);
        }

        match lost {
            Some(path) => warn!(path_id = path.id(), binding = %path.binding(), "Egress path lost"),
            None => debug!("Invalidate called with no current egress path"),
        }
    }

    /// Currently published path, if any
    pub fn current(&self) -> Option<EgressPath> {
        self.current.borrow().clone()
    }

    /// Number of paths acquired and not yet released
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PathProvider for PathRegistry {
    async fn acquire(&self) -> Result<EgressPath, PathError> {
        let mut rx = self.current.subscribe();
        let path = rx
            .wait_for(|path| path.as_ref().is_some_and(EgressPath::is_available))
            .await
            .map_err(|_| PathError::ProviderClosed)?
            .clone();

        match path {
            Some(path) => {
                self.leases.fetch_add(1, Ordering::Relaxed);
                debug!(path_id = path.id(), "Egress path acquired");
                Ok(path)
            }
            None => Err(PathError::ProviderClosed),
        }
    }

    fn release(&self, path: EgressPath) {
        let _ = self
            .leases
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        debug!(path_id = path.id(), "Egress path released");
    }
}

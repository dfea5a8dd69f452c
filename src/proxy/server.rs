//! Proxy listener and accept loop
//!
//! `start` binds the listener and returns a [`ServerHandle`] right away; the
//! accept loop runs in its own task and spawns one task per client. `stop`
//! closes the listener but leaves in-flight sessions to finish on their own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace};

use crate::config::ProxyServerConfig;
use crate::error::BindError;
use crate::proxy::egress::EgressBinder;
use crate::proxy::path::EgressPath;
use crate::proxy::relay::Relay;
use crate::proxy::request::RequestSniffer;
use crate::proxy::session::{Session, SessionContext, SessionOutcome};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Whether the accept loop keeps accepting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopped,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    binder: Arc<dyn EgressBinder>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyServerConfig, binder: Arc<dyn EgressBinder>) -> Self {
        Self { config, binder }
    }

    /// Bind the listener and start accepting. All sessions dial over `path`.
    #[instrument(skip(self, path), fields(path_id = path.id()))]
    pub async fn start(&self, path: EgressPath) -> Result<ServerHandle, BindError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BindError::new(addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::new(addr.clone(), e))?;

        info!("Proxy server listening on {} via {}", local_addr, path.binding());

        let ctx = SessionContext {
            binder: self.binder.clone(),
            path: path.clone(),
            sniffer: RequestSniffer::new(self.config.max_request_line),
            relay: Relay::new(self.config.relay_buffer_size),
            connect_timeout: self.config.connect_timeout(),
            skip_tunnel_headers: self.config.skip_tunnel_headers,
        };

        let (state_tx, state_rx) = watch::channel(ServerState::Running);
        let active = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(accept_loop(listener, ctx, state_rx, active.clone()));

        Ok(ServerHandle {
            local_addr,
            path,
            state: state_tx,
            active,
            accept_task,
        })
    }
}

/// Running server. Owns the lifecycle state read by the accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    path: EgressPath,
    state: watch::Sender<ServerState>,
    active: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn path(&self) -> &EgressPath {
        &self.path
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Sessions accepted and not yet finished
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop accepting and close the listener. Running sessions are left alone.
    pub async fn stop(self) {
        self.state.send_replace(ServerState::Stopped);
        if let Err(e) = self.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        info!("Proxy server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    mut state: watch::Receiver<ServerState>,
    active: Arc<AtomicUsize>,
) {
    let mut next_id: u64 = 0;

    loop {
        if *state.borrow_and_update() == ServerState::Stopped {
            break;
        }

        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        next_id += 1;
                        spawn_session(next_id, stream, client_addr, ctx.clone(), active.clone());
                    }
                    Err(e) => {
                        if *state.borrow() == ServerState::Stopped {
                            break;
                        }
                        error!("Accept error: {}", e);
                        if !accept_backoff(&mut state).await {
                            break;
                        }
                    }
                }
            }
            changed = state.changed() => {
                // A dropped handle stops the server as well.
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    drop(listener);
    info!("Proxy listener closed");
}

/// Sit out a failed accept. Errors like EMFILE persist until sessions release
/// descriptors. Returns false if the server was stopped meanwhile.
async fn accept_backoff(state: &mut watch::Receiver<ServerState>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
        changed = state.changed() => {
            changed.is_ok() && *state.borrow() != ServerState::Stopped
        }
    }
}

fn spawn_session(
    id: u64,
    stream: TcpStream,
    client_addr: SocketAddr,
    ctx: SessionContext,
    active: Arc<AtomicUsize>,
) {
    let guard = SessionGuard::new(active);

    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(session_id = id, error = %e, "Could not disable Nagle on client connection");
        }

        let outcome = Session::new(id, client_addr, stream).run(&ctx).await;
        match outcome {
            SessionOutcome::Completed { .. } => {}
            other => debug!(session_id = id, "Session ended early: {:?}", other),
        }
    });
}

/// Tracks a live session for `active_sessions`
struct SessionGuard {
    active: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self { active }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

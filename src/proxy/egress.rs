//! Egress dialing over a pinned network path
//!
//! Outbound sockets are built with socket2 so they can be bound to the path's
//! interface and/or source address before connecting. Host names are resolved
//! over the same path. There is no fallback to the default route: if the path
//! cannot be bound the dial fails.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace, warn};

use crate::error::DialError;
use crate::proxy::path::{EgressPath, PathBinding};
use crate::proxy::request::Destination;
use crate::proxy::resolver::PathResolver;

/// Opens connections over a specific egress path
#[async_trait]
pub trait EgressBinder: Send + Sync {
    /// Connect to `host:port` using only `path`'s route
    async fn dial(
        &self,
        path: &EgressPath,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<TcpStream, DialError>;
}

/// Binder backed by real sockets
#[derive(Debug, Clone, Default)]
pub struct SocketBinder {
    resolver: PathResolver,
}

impl SocketBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `resolver` for host names instead of the default name servers
    pub fn with_resolver(mut self, resolver: PathResolver) -> Self {
        self.resolver = resolver;
        self
    }

    async fn dial_inner(
        &self,
        path: &EgressPath,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, DialError> {
        let target = Destination::new(host, port).to_string();
        let binding = path.binding();

        let addrs: Vec<SocketAddr> = self
            .resolver
            .resolve(path, host, port)
            .await?
            .into_iter()
            .filter(|addr| match binding.local_addr {
                Some(local) => local.is_ipv4() == addr.is_ipv4(),
                None => true,
            })
            .collect();

        if addrs.is_empty() {
            return Err(DialError::ConnectFailed {
                target,
                reason: "no address reachable from the egress path's address family".into(),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            if !path.is_available() {
                return Err(DialError::PathUnavailable(format!(
                    "path {} lost while dialing {}",
                    path.id(),
                    target
                )));
            }

            let socket = pinned_socket(binding, addr, Type::STREAM, Protocol::TCP).map_err(|e| {
                DialError::PathUnavailable(format!("cannot bind to {}: {}", binding, e))
            })?;

            match connect_socket(socket, addr).await {
                Ok(stream) => {
                    if !path.is_available() {
                        return Err(DialError::PathUnavailable(format!(
                            "path {} lost while dialing {}",
                            path.id(),
                            target
                        )));
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Could not disable Nagle on egress connection");
                    }
                    debug!(%addr, "Egress connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Egress connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(DialError::ConnectFailed {
            target,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".into()),
        })
    }
}

#[async_trait]
impl EgressBinder for SocketBinder {
    #[instrument(skip(self, path), fields(path_id = path.id()))]
    async fn dial(
        &self,
        path: &EgressPath,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        if !path.is_available() {
            return Err(DialError::PathUnavailable(format!(
                "path {} has been lost",
                path.id()
            )));
        }
        if !path.binding().is_pinned() {
            return Err(DialError::PathUnavailable(format!(
                "path {} has no binding",
                path.id()
            )));
        }

        match tokio::time::timeout(timeout, self.dial_inner(path, host, port)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                target: Destination::new(host, port).to_string(),
            }),
        }
    }
}

/// Create a socket for talking to `peer`, pinned to `binding`
pub(crate) fn pinned_socket(
    binding: &PathBinding,
    peer: SocketAddr,
    ty: Type,
    protocol: Protocol,
) -> io::Result<Socket> {
    if !binding.is_pinned() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "egress binding names no interface or source address",
        ));
    }

    let socket = Socket::new(Domain::for_address(peer), ty, Some(protocol))?;

    if let Some(interface) = &binding.interface {
        bind_to_interface(&socket, interface)?;
    }

    if let Some(local) = binding.local_addr {
        socket.bind(&SocketAddr::new(local, 0).into())?;
    }

    Ok(socket)
}

#[cfg(any(target_os = "android", target_os = "linux", target_os = "fuchsia"))]
fn bind_to_interface(socket: &Socket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "linux", target_os = "fuchsia")))]
fn bind_to_interface(_socket: &Socket, interface: &str) -> io::Result<()> {
    warn!(interface, "Interface pinning is not supported on this platform");
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot pin sockets to interface '{}' on this platform", interface),
    ))
}

/// Non-blocking connect of an already-bound socket
async fn connect_socket(socket: Socket, addr: SocketAddr) -> io::Result<TcpStream> {
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.writable().await?;

    if let Some(e) = stream.take_error()? {
        warn!(%addr, error = %e, "Egress socket reported an error after connect");
        return Err(e);
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::proxy::path::PathRegistry;
    use crate::proxy::resolver::tests::{name_server, silent_name_server};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn loopback_path() -> (PathRegistry, EgressPath) {
        let registry = PathRegistry::new();
        let path = registry.publish(PathBinding::source("127.0.0.1".parse().unwrap()));
        (registry, path)
    }

    #[tokio::test]
    async fn dial_binds_source_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            peer
        });

        let (_registry, path) = loopback_path();
        let mut stream = SocketBinder::new()
            .dial(&path, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(stream.local_addr().unwrap().ip().to_string(), "127.0.0.1");

        stream.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");

        let peer = accept.await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn dial_on_lost_path_is_path_unavailable() {
        let (registry, path) = loopback_path();
        registry.invalidate();

        let err = SocketBinder::new()
            .dial(&path, "127.0.0.1", 9, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::PathUnavailable(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn dial_refused_is_connect_failed() {
        // Grab a free port, then close the listener so nothing is accepting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_registry, path) = loopback_path();
        let err = SocketBinder::new()
            .dial(&path, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::ConnectFailed { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn unbindable_source_is_path_unavailable() {
        let registry = PathRegistry::new();
        // TEST-NET-3 is never assigned to a local interface.
        let path = registry.publish(PathBinding::source("203.0.113.77".parse().unwrap()));

        let err = SocketBinder::new()
            .dial(&path, "127.0.0.1", 9, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::PathUnavailable(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn family_mismatch_is_connect_failed() {
        let (_registry, path) = loopback_path();
        let err = SocketBinder::new()
            .dial(&path, "::1", 80, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::ConnectFailed { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn unbound_path_never_dials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (path, _alive) = EgressPath::new(1, PathBinding::default());

        let err = SocketBinder::new()
            .dial(&path, "127.0.0.1", port, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::PathUnavailable(_)), "got {:?}", err);

        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "an unbound path reached the destination");
    }

    #[tokio::test]
    async fn host_names_resolve_over_the_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, peers) = name_server(vec![("echo.test", "127.0.0.1".parse().unwrap())]).await;

        let (_registry, path) = loopback_path();
        let binder =
            SocketBinder::new().with_resolver(PathResolver::new(vec![server], TIMEOUT));
        let stream = binder.dial(&path, "echo.test", port, TIMEOUT).await.unwrap();

        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
        assert_eq!(peers.lock().len(), 1);
    }

    #[tokio::test]
    async fn slow_dial_is_timeout() {
        let (server, _socket) = silent_name_server().await;
        let (_registry, path) = loopback_path();
        let binder = SocketBinder::new()
            .with_resolver(PathResolver::new(vec![server], Duration::from_secs(5)));

        let err = binder
            .dial(&path, "slow.test", 80, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout { ref target } if target == "slow.test:80"), "got {:?}", err);
        assert!(err.is_retriable());
    }
}

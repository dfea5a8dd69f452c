//! Per-connection proxy session
//!
//! A session owns one client connection and, once dialed, one egress
//! connection. It moves through `Parsing -> Dialing -> Handshaking ->
//! Relaying -> Closed`; any failure closes whatever it owns and ends it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{DialError, HandshakeError, ParseError};
use crate::proxy::egress::EgressBinder;
use crate::proxy::path::EgressPath;
use crate::proxy::relay::{close_quietly, Relay, RelayOutcome};
use crate::proxy::request::{Destination, ProxyMode, RequestSniffer};
use crate::proxy::tunnel::TunnelEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Parsing,
    Dialing,
    Handshaking,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsing => "parsing",
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything a session needs besides its client connection
#[derive(Clone)]
pub struct SessionContext {
    pub binder: Arc<dyn EgressBinder>,
    pub path: EgressPath,
    pub sniffer: RequestSniffer,
    pub relay: Relay,
    pub connect_timeout: Duration,
    pub skip_tunnel_headers: bool,
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    Completed {
        mode: ProxyMode,
        destination: Destination,
        relay: RelayOutcome,
    },
    Rejected(ParseError),
    DialFailed(DialError),
    HandshakeFailed(HandshakeError),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

pub struct Session<S> {
    id: u64,
    peer: SocketAddr,
    client: BufReader<S>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(id: u64, peer: SocketAddr, client: S) -> Self {
        Self {
            id,
            peer,
            client: BufReader::new(client),
            state: SessionState::Parsing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    /// Drive the session to completion
    #[instrument(name = "session", skip_all, fields(session_id = self.id, client = %self.peer))]
    pub async fn run(mut self, ctx: &SessionContext) -> SessionOutcome {
        let request = match ctx.sniffer.parse(&mut self.client).await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejecting client request");
                self.close_client().await;
                return SessionOutcome::Rejected(e);
            }
        };

        let mode = request.mode();
        let destination = request.destination.clone();
        debug!(method = %request.method, %destination, mode = mode.as_str(), "Parsed request");

        if mode == ProxyMode::Tunnel && ctx.skip_tunnel_headers {
            if let Err(e) = ctx.sniffer.skip_headers(&mut self.client).await {
                debug!(error = %e, "Rejecting CONNECT header block");
                self.close_client().await;
                return SessionOutcome::Rejected(e);
            }
        }

        self.transition(SessionState::Dialing);
        let mut egress = match ctx
            .binder
            .dial(&ctx.path, &destination.host, destination.port, ctx.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                match &e {
                    DialError::PathUnavailable(_) => warn!(error = %e, %destination, "Egress path unavailable"),
                    _ => debug!(error = %e, %destination, "Egress dial failed"),
                }
                self.close_client().await;
                return SessionOutcome::DialFailed(e);
            }
        };

        self.transition(SessionState::Handshaking);
        if let Err(e) =
            TunnelEngine::handshake(mode, &request.raw_line, &mut self.client, &mut egress).await
        {
            debug!(error = %e, %destination, "Handshake failed");
            self.transition(SessionState::Closed);
            return SessionOutcome::HandshakeFailed(e);
        }

        self.transition(SessionState::Relaying);
        info!(%destination, mode = mode.as_str(), "Relaying");

        let loss = ctx.path.loss_signal();
        let relay = ctx.relay.run_until(self.client, egress, loss.wait()).await;

        if relay.path_lost {
            warn!(%destination, "Session ended by egress path loss");
        } else {
            debug!(
                %destination,
                bytes_sent = relay.client_to_egress.bytes,
                bytes_received = relay.egress_to_client.bytes,
                "Session finished"
            );
        }

        SessionOutcome::Completed {
            mode,
            destination,
            relay,
        }
    }

    async fn close_client(&mut self) {
        close_quietly(&mut self.client).await;
        self.transition(SessionState::Closed);
    }
}

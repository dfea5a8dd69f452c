//! Proxy implementation
//!
//! This module provides the forwarding proxy itself:
//! - Request-line sniffing for CONNECT and absolute-URI requests
//! - Egress dialing pinned to a selected network path
//! - Name resolution over that same path
//! - CONNECT acknowledgment and request-line replay
//! - Bidirectional relay with half-close
//! - Listener lifecycle and per-connection sessions

pub mod egress;
pub mod path;
pub mod relay;
pub mod request;
pub mod resolver;
pub mod server;
pub mod session;
pub mod tunnel;

pub use egress::{EgressBinder, SocketBinder};
pub use path::{EgressPath, PathBinding, PathLoss, PathProvider, PathRegistry};
pub use relay::{Relay, RelayOutcome};
pub use request::{Destination, ProxyMode, ProxyRequest, RequestSniffer};
pub use resolver::PathResolver;
pub use server::{ProxyServer, ServerHandle, ServerState};
pub use session::{Session, SessionContext, SessionOutcome, SessionState};
pub use tunnel::TunnelEngine;

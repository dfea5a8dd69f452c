//! Name resolution over a pinned network path
//!
//! The system resolver follows the default route, which may have no upstream
//! at all. Names are instead looked up with plain DNS queries sent from a UDP
//! socket pinned exactly like the egress connection that will use the answer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use socket2::{Protocol, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use crate::error::DialError;
use crate::proxy::egress::pinned_socket;
use crate::proxy::path::{EgressPath, PathBinding};
use crate::proxy::request::Destination;

pub const DNS_PORT: u16 = 53;

/// Name servers used when none are configured
pub const DEFAULT_NAME_SERVERS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

const MAX_RESPONSE_SIZE: usize = 4096;

#[derive(Debug, Error)]
enum LookupError {
    #[error("cannot pin query socket: {0}")]
    Bind(#[source] io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Resolves host names through name servers reached over the egress path
#[derive(Debug, Clone)]
pub struct PathResolver {
    servers: Vec<SocketAddr>,
    query_timeout: Duration,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(
            DEFAULT_NAME_SERVERS
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), DNS_PORT))
                .collect(),
            Duration::from_secs(3),
        )
    }
}

impl PathResolver {
    pub fn new(servers: Vec<SocketAddr>, query_timeout: Duration) -> Self {
        Self {
            servers,
            query_timeout,
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Addresses for `host:port`. IP literals are returned without a lookup.
    ///
    /// Only record types matching the path's source address family are
    /// queried, and only name servers of that family are asked. Servers are
    /// tried in order until one returns at least one address.
    #[instrument(skip(self, path), fields(path_id = path.id()))]
    pub async fn resolve(
        &self,
        path: &EgressPath,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, DialError> {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let binding = path.binding();
        if !binding.is_pinned() {
            return Err(DialError::PathUnavailable(format!(
                "path {} has no binding",
                path.id()
            )));
        }

        let target = Destination::new(host, port).to_string();
        let name = Name::from_ascii(host).map_err(|e| DialError::ConnectFailed {
            target: target.clone(),
            reason: format!("invalid host name: {}", e),
        })?;

        let record_types: &[RecordType] = match binding.local_addr {
            Some(IpAddr::V4(_)) => &[RecordType::A],
            Some(IpAddr::V6(_)) => &[RecordType::AAAA],
            None => &[RecordType::A, RecordType::AAAA],
        };

        let servers = self.servers.iter().filter(|server| match binding.local_addr {
            Some(local) => local.is_ipv4() == server.is_ipv4(),
            None => true,
        });

        let mut last_error =
            String::from("no name server reachable from the egress path's address family");

        for &server in servers {
            let mut addrs = Vec::new();
            for &record_type in record_types {
                match self.query(binding, server, &name, record_type).await {
                    Ok(ips) if ips.is_empty() => {
                        last_error = format!("{} returned no {} records", server, record_type);
                    }
                    Ok(ips) => addrs.extend(ips.into_iter().map(|ip| SocketAddr::new(ip, port))),
                    Err(LookupError::Bind(e)) => {
                        return Err(DialError::PathUnavailable(format!(
                            "cannot bind to {}: {}",
                            binding, e
                        )));
                    }
                    Err(e) => {
                        debug!(%server, %record_type, error = %e, "Name server query failed");
                        last_error = e.to_string();
                    }
                }
            }

            if !addrs.is_empty() {
                debug!(%server, count = addrs.len(), "Resolved over egress path");
                return Ok(addrs);
            }
        }

        Err(DialError::ConnectFailed {
            target,
            reason: format!("resolve failed: {}", last_error),
        })
    }

    async fn query(
        &self,
        binding: &PathBinding,
        server: SocketAddr,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, LookupError> {
        let socket = pinned_socket(binding, server, Type::DGRAM, Protocol::UDP)
            .map_err(LookupError::Bind)?;
        socket.set_nonblocking(true).map_err(LookupError::Bind)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(LookupError::Bind)?;
        socket
            .connect(server)
            .await
            .map_err(|e| LookupError::Failed(format!("{} unreachable: {}", server, e)))?;

        let id: u16 = rand::random();
        let mut request = Message::new();
        request.set_id(id);
        request.set_message_type(MessageType::Query);
        request.set_op_code(OpCode::Query);
        request.set_recursion_desired(true);
        request.add_query(Query::query(name.clone(), record_type));

        let bytes = request
            .to_bytes()
            .map_err(|e| LookupError::Failed(format!("cannot encode query: {}", e)))?;
        socket
            .send(&bytes)
            .await
            .map_err(|e| LookupError::Failed(format!("send to {} failed: {}", server, e)))?;

        let response = timeout(self.query_timeout, read_response(&socket, id))
            .await
            .map_err(|_| LookupError::Failed(format!("{} timed out", server)))??;

        if response.response_code() != ResponseCode::NoError {
            return Err(LookupError::Failed(format!(
                "{} answered {}",
                server,
                response.response_code()
            )));
        }

        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect())
    }
}

/// Wait for the response to query `id`, skipping anything else
async fn read_response(socket: &UdpSocket, id: u16) -> Result<Message, LookupError> {
    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    loop {
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| LookupError::Failed(format!("receive failed: {}", e)))?;

        match Message::from_bytes(&buf[..n]) {
            Ok(message) if message.id() == id && message.message_type() == MessageType::Response => {
                return Ok(message);
            }
            Ok(message) => trace!(id = message.id(), "Ignoring unrelated DNS message"),
            Err(e) => trace!(error = %e, "Ignoring undecodable DNS message"),
        }
    }
}

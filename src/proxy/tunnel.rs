//! Mode-specific handshake before relaying
//!
//! CONNECT requests are acknowledged to the client and the request line is
//! dropped. Plain requests have their line replayed to the destination so it
//! sees it exactly once before the relay carries the rest.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::HandshakeError;
use crate::proxy::relay::close_quietly;
use crate::proxy::request::ProxyMode;

/// Sent to the client once a CONNECT tunnel's egress side is up
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Performs the per-mode handshake
pub struct TunnelEngine;

impl TunnelEngine {
    /// Write the handshake for `mode`. Both connections are shut down if a
    /// write fails.
    #[instrument(skip(raw_line, client, egress))]
    pub async fn handshake<C, E>(
        mode: ProxyMode,
        raw_line: &str,
        client: &mut C,
        egress: &mut E,
    ) -> Result<(), HandshakeError>
    where
        C: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let result = match mode {
            ProxyMode::Tunnel => Self::acknowledge(client).await,
            ProxyMode::Forward => Self::forward_line(raw_line, egress).await,
        };

        if let Err(e) = result {
            debug!(error = %e, "Handshake failed, closing both ends");
            close_quietly(client).await;
            close_quietly(egress).await;
            return Err(HandshakeError::IoFailure(e));
        }

        Ok(())
    }

    async fn acknowledge<C>(client: &mut C) -> std::io::Result<()>
    where
        C: AsyncWrite + Unpin,
    {
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await
    }

    async fn forward_line<E>(raw_line: &str, egress: &mut E) -> std::io::Result<()>
    where
        E: AsyncWrite + Unpin,
    {
        let mut line = Vec::with_capacity(raw_line.len() + 2);
        line.extend_from_slice(raw_line.as_bytes());
        line.extend_from_slice(b"\r\n");

        egress.write_all(&line).await?;
        egress.flush().await
    }
}

//! Bidirectional byte relay
//!
//! Each direction runs in its own task, copies one chunk at a time and flushes
//! after every write. A direction that reaches EOF half-closes its peer and
//! stops; the other keeps going until it ends too. Both connections are closed
//! once both directions are done.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::error::RelayError;

/// How one copy direction ended
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    pub bytes: u64,
    /// `None` when the direction ended on a clean EOF
    pub error: Option<RelayError>,
}

/// Summary of a finished relay. Informational only.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub client_to_egress: DirectionOutcome,
    pub egress_to_client: DirectionOutcome,
    /// The egress path was lost and both directions were cut short
    pub path_lost: bool,
}

impl RelayOutcome {
    pub fn is_clean(&self) -> bool {
        !self.path_lost
            && self.client_to_egress.error.is_none()
            && self.egress_to_client.error.is_none()
    }
}

/// Copies bytes between a client and an egress connection
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl Relay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Relay until both directions end
    pub async fn run<A, B>(&self, client: A, egress: B) -> RelayOutcome
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.run_until(client, egress, std::future::pending()).await
    }

    /// Relay until both directions end or `lost` resolves, whichever is first
    #[instrument(skip_all, fields(buffer_size = self.buffer_size))]
    pub async fn run_until<A, B, F>(&self, client: A, egress: B, lost: F) -> RelayOutcome
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
        F: Future<Output = ()>,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (egress_read, egress_write) = tokio::io::split(egress);

        let upload = Arc::new(AtomicU64::new(0));
        let download = Arc::new(AtomicU64::new(0));

        let mut upstream: JoinHandle<Option<RelayError>> = tokio::spawn(copy_direction(
            client_read,
            egress_write,
            self.buffer_size,
            upload.clone(),
        ));
        let mut downstream: JoinHandle<Option<RelayError>> = tokio::spawn(copy_direction(
            egress_read,
            client_write,
            self.buffer_size,
            download.clone(),
        ));

        tokio::pin!(lost);

        let mut path_lost = false;
        let mut upstream_result = None;
        let mut downstream_result = None;

        while upstream_result.is_none() || downstream_result.is_none() {
            tokio::select! {
                result = &mut upstream, if upstream_result.is_none() => {
                    upstream_result = Some(finished(result));
                }
                result = &mut downstream, if downstream_result.is_none() => {
                    downstream_result = Some(finished(result));
                }
                _ = &mut lost, if !path_lost => {
                    debug!("Egress path lost, aborting relay");
                    path_lost = true;
                    upstream.abort();
                    downstream.abort();
                }
            }
        }

        let outcome = RelayOutcome {
            client_to_egress: DirectionOutcome {
                bytes: upload.load(Ordering::Relaxed),
                error: upstream_result.flatten(),
            },
            egress_to_client: DirectionOutcome {
                bytes: download.load(Ordering::Relaxed),
                error: downstream_result.flatten(),
            },
            path_lost,
        };

        debug!(
            bytes_sent = outcome.client_to_egress.bytes,
            bytes_received = outcome.egress_to_client.bytes,
            path_lost = outcome.path_lost,
            "Relay closed"
        );

        outcome
    }
}

fn finished(result: Result<Option<RelayError>, tokio::task::JoinError>) -> Option<RelayError> {
    match result {
        Ok(error) => error,
        Err(_) => Some(RelayError::Aborted),
    }
}

/// Copy one direction chunk by chunk, then half-close the writer.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
) -> Option<RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(RelayError::Read(e)),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(RelayError::Write(e));
        }
        if let Err(e) = writer.flush().await {
            break Some(RelayError::Write(e));
        }

        counter.fetch_add(n as u64, Ordering::Relaxed);
    };

    if let Some(e) = &error {
        trace!(error = %e, "Relay direction ended with error");
    }

    close_quietly(&mut writer).await;
    error
}

/// Shut down the write side, ignoring errors. Safe to call repeatedly.
pub async fn close_quietly<W>(stream: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        trace!(error = %e, "Ignoring error while closing connection");
    }
}

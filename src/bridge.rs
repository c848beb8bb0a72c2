use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use bon::Builder;
use metrics::counter;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::GatewayError,
    target::{TargetSession, TargetWriter, TerminalSize},
    telemetry::{TELEMETRY_COUNTER_RELAYED_BYTES, TELEMETRY_KEY_DIRECTION},
};

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 32_768;

/// Why a bridge stopped relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    ClientClosed,
    TargetClosed,
    ClientError,
    TargetError,
    Cancelled,
}

impl Display for BridgeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BridgeEnd::ClientClosed => "client closed",
            BridgeEnd::TargetClosed => "target closed",
            BridgeEnd::ClientError => "client error",
            BridgeEnd::TargetError => "target error",
            BridgeEnd::Cancelled => "cancelled",
        })
    }
}

/// Totals for a finished bridge.
#[derive(Debug)]
pub struct BridgeSummary {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub end: BridgeEnd,
    /// The I/O failure behind [`BridgeEnd::ClientError`] and [`BridgeEnd::TargetError`].
    pub error: Option<GatewayError>,
}

// How one direction of the relay stopped.
type PumpEnd = (BridgeEnd, Option<std::io::Error>);

/// Relays bytes between the client's channel and an established target session.
///
/// Bytes are forwarded unmodified and in order in each direction. An EOF from the client
/// only half-closes the session: the target's input is shut down and its remaining output
/// still reaches the client. The bridge returns once the target ends, either side fails,
/// or the bridge is cancelled.
#[derive(Debug, Clone, Builder)]
pub struct StreamBridge {
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
}

#[derive(Default)]
struct RelayCounters {
    client_to_target: AtomicU64,
    target_to_client: AtomicU64,
}

impl StreamBridge {
    /// Relay until either side ends or `cancellation` fires.
    ///
    /// Terminal sizes published on `resize` are applied to the target. The target's
    /// resources are left in place: the caller releases `target` afterwards.
    pub async fn run<C>(
        &self,
        client: C,
        target: &mut TargetSession,
        resize: watch::Receiver<Option<TerminalSize>>,
        cancellation: CancellationToken,
    ) -> BridgeSummary
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        let counters = RelayCounters::default();
        let (end, error) = {
            let to_target = pump_to_target(
                &mut client_reader,
                target.writer.as_mut(),
                resize,
                &counters.client_to_target,
                self.buffer_size,
            );
            let to_client = pump_to_client(
                target.reader.as_mut(),
                &mut client_writer,
                &counters.target_to_client,
                self.buffer_size,
            );
            tokio::pin!(to_target, to_client);
            let mut client_open = true;
            loop {
                tokio::select! {
                    end = &mut to_target, if client_open => {
                        if end.0 != BridgeEnd::ClientClosed {
                            break end;
                        }
                        // Half-close: keep relaying whatever the target still has to say.
                        #[cfg(not(coverage_nightly))]
                        tracing::debug!("Client sent EOF.");
                        client_open = false;
                    }
                    end = &mut to_client => break end,
                    _ = cancellation.cancelled() => break (BridgeEnd::Cancelled, None),
                }
            }
        };
        // Both directions end together.
        let _ = client_writer.shutdown().await;
        let _ = target.writer.shutdown().await;
        BridgeSummary {
            client_to_target: counters.client_to_target.load(Ordering::Acquire),
            target_to_client: counters.target_to_client.load(Ordering::Acquire),
            end,
            error: error.map(GatewayError::RelayIo),
        }
    }
}

async fn pump_to_target<R>(
    client: &mut R,
    target: &mut dyn TargetWriter,
    mut resize: watch::Receiver<Option<TerminalSize>>,
    counter: &AtomicU64,
    buffer_size: usize,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    let metric = counter!(TELEMETRY_COUNTER_RELAYED_BYTES, TELEMETRY_KEY_DIRECTION => "client_to_target");
    let mut buf = vec![0u8; buffer_size];
    let mut resize_open = true;
    loop {
        tokio::select! {
            result = client.read(&mut buf) => {
                let n = match result {
                    Ok(0) => {
                        if let Err(error) = target.shutdown().await {
                            #[cfg(not(coverage_nightly))]
                            tracing::debug!(%error, "Error shutting down target input.");
                        }
                        return (BridgeEnd::ClientClosed, None);
                    }
                    Ok(n) => n,
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        tracing::debug!(%error, "Error reading from client.");
                        return (BridgeEnd::ClientError, Some(error));
                    }
                };
                if let Err(error) = write_chunk(target, &buf[..n]).await {
                    #[cfg(not(coverage_nightly))]
                    tracing::debug!(%error, "Error writing to target.");
                    return (BridgeEnd::TargetError, Some(error));
                }
                counter.fetch_add(n as u64, Ordering::AcqRel);
                metric.increment(n as u64);
            }
            changed = resize.changed(), if resize_open => {
                if changed.is_err() {
                    resize_open = false;
                    continue;
                }
                let size = *resize.borrow_and_update();
                if let Some(size) = size
                    && let Err(error) = target.resize(size)
                {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(%error, %size, "Failed to resize target terminal.");
                }
            }
        }
    }
}

async fn pump_to_client<R, W>(
    target: &mut R,
    client: &mut W,
    counter: &AtomicU64,
    buffer_size: usize,
) -> PumpEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let metric = counter!(TELEMETRY_COUNTER_RELAYED_BYTES, TELEMETRY_KEY_DIRECTION => "target_to_client");
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match target.read(&mut buf).await {
            Ok(0) => return (BridgeEnd::TargetClosed, None),
            Ok(n) => n,
            Err(error) => {
                // A terminal whose process exited reports EIO rather than EOF.
                #[cfg(not(coverage_nightly))]
                tracing::debug!(%error, "Error reading from target.");
                return (BridgeEnd::TargetError, Some(error));
            }
        };
        if let Err(error) = write_chunk(client, &buf[..n]).await {
            #[cfg(not(coverage_nightly))]
            tracing::debug!(%error, "Error writing to client.");
            return (BridgeEnd::ClientError, Some(error));
        }
        counter.fetch_add(n as u64, Ordering::AcqRel);
        metric.increment(n as u64);
    }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

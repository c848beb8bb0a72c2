use std::{fmt::Display, io, pin::Pin};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::identity::Identity;

#[cfg(unix)]
mod command;
mod ssh;

#[cfg(unix)]
pub use command::CommandConnector;
pub use ssh::{SshConnector, SshTarget};

/// Failure to establish the outbound leg of a session.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("Unknown target {0}")]
    UnknownTarget(String),
    #[error("Unable to allocate a pseudo-terminal: {0}")]
    Allocate(String),
    #[error("Unable to spawn target process: {0}")]
    Spawn(String),
    #[error("Target unreachable: {0}")]
    Unreachable(String),
    #[error("Target refused the gateway: {0}")]
    Rejected(String),
    #[error("Timed out connecting to target")]
    Timeout,
}

/// Character-cell size of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    // SSH carries sizes as u32; anything larger than a u16 is clamped.
    pub(crate) fn from_ssh(col_width: u32, row_height: u32) -> Self {
        TerminalSize {
            cols: col_width.min(u16::MAX.into()) as u16,
            rows: row_height.min(u16::MAX.into()) as u16,
        }
    }
}

impl Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Pseudo-terminal requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub term: String,
    pub size: TerminalSize,
}

/// Everything a connector needs to open the outbound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub identity: Identity,
    pub target: String,
    pub terminal: Option<TerminalRequest>,
    pub command: Option<String>,
}

/// Write side of a target session.
pub trait TargetWriter: AsyncWrite + Send + Unpin {
    /// Propagate a new terminal size. Targets without a terminal ignore this.
    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        let _ = size;
        Ok(())
    }
}

// Write half of a plain duplex stream, without terminal control.
pub(crate) struct PlainWriter<W>(pub(crate) W);

impl<W: AsyncWrite + Unpin> AsyncWrite for PlainWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl<W: AsyncWrite + Send + Unpin> TargetWriter for PlainWriter<W> {}

/// Owner of everything the outbound session allocated.
#[async_trait]
pub trait TargetGuard: Send {
    /// Tear the session down, returning its exit status when the target reported one.
    async fn release(self: Box<Self>) -> Option<u32>;
}

// Guard for targets that own nothing besides their stream.
pub(crate) struct NoopGuard;

#[async_trait]
impl TargetGuard for NoopGuard {
    async fn release(self: Box<Self>) -> Option<u32> {
        None
    }
}

/// An established outbound session: a byte stream in each direction and its resources.
pub struct TargetSession {
    pub(crate) reader: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) writer: Box<dyn TargetWriter>,
    pub(crate) guard: Box<dyn TargetGuard>,
}

impl TargetSession {
    /// Build a session from its parts.
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn TargetWriter>,
        guard: Box<dyn TargetGuard>,
    ) -> Self {
        TargetSession {
            reader,
            writer,
            guard,
        }
    }

    /// Build a session over a single duplex stream, with an optional resource guard.
    pub fn from_stream<S>(stream: S, guard: Option<Box<dyn TargetGuard>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        TargetSession {
            reader: Box::new(reader),
            writer: Box::new(PlainWriter(writer)),
            guard: guard.unwrap_or_else(|| Box::new(NoopGuard)),
        }
    }

    /// Close both streams, then release the remaining resources exactly once.
    pub async fn release(self) -> Option<u32> {
        let TargetSession {
            reader,
            writer,
            guard,
        } = self;
        drop(reader);
        drop(writer);
        guard.release().await
    }
}

/// Opens outbound sessions toward authorized targets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Open the outbound session. On error, nothing allocated along the way may outlive the call.
    async fn connect(&self, request: &TargetRequest) -> Result<TargetSession, ConnectError>;
}

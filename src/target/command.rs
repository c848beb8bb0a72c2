use std::{io, os::unix::process::ExitStatusExt, pin::Pin};

use async_trait::async_trait;
use pty_process::{OwnedWritePty, Pty, Size};
use tokio::{io::AsyncWrite, process::Child};
use tracing::{debug, info, warn};

use super::{
    ConnectError, TargetConnector, TargetGuard, TargetRequest, TargetSession, TargetWriter,
    TerminalSize,
};
use crate::error::ServerError;

// Placeholders substituted in every argument of the command template.
const TARGET_PLACEHOLDER: &str = "{target}";
const IDENTITY_PLACEHOLDER: &str = "{identity}";
const DEFAULT_TERM: &str = "xterm-256color";

/// Runs a local command inside a fresh pseudo-terminal for each session.
///
/// Every argument of the template may reference `{target}` and `{identity}`, e.g.
/// `ssh -tt {target}` hands the session to the system SSH client.
#[derive(Debug, Clone)]
pub struct CommandConnector {
    program: String,
    args: Vec<String>,
}

impl CommandConnector {
    pub fn new(template: &str) -> color_eyre::Result<Self> {
        let mut parts = template.split_whitespace().map(String::from);
        let program = parts.next().ok_or(ServerError::InvalidTargetCommand)?;
        Ok(CommandConnector {
            program,
            args: parts.collect(),
        })
    }

    fn render_args(&self, request: &TargetRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace(TARGET_PLACEHOLDER, &request.target)
                    .replace(IDENTITY_PLACEHOLDER, &request.identity.id)
            })
            .collect()
    }
}

impl From<TerminalSize> for Size {
    fn from(size: TerminalSize) -> Self {
        // Rows come first here.
        Size::new(size.rows, size.cols)
    }
}

#[async_trait]
impl TargetConnector for CommandConnector {
    async fn connect(&self, request: &TargetRequest) -> Result<TargetSession, ConnectError> {
        let pty = Pty::new().map_err(|error| ConnectError::Allocate(error.to_string()))?;
        let pts = pty
            .pts()
            .map_err(|error| ConnectError::Allocate(error.to_string()))?;
        let args = self.render_args(request);
        let term = request
            .terminal
            .as_ref()
            .map(|terminal| terminal.term.as_str())
            .filter(|term| !term.is_empty())
            .unwrap_or(DEFAULT_TERM);
        let child = pty_process::Command::new(&self.program)
            .args(&args)
            .env("TERM", term)
            .env("LIGHTHOUSE_TARGET", &request.target)
            .env("LIGHTHOUSE_IDENTITY", &request.identity.id)
            .env(
                "LIGHTHOUSE_COMMAND",
                request.command.as_deref().unwrap_or_default(),
            )
            .spawn(&pts)
            .map_err(|error| ConnectError::Spawn(format!("{}: {error}", self.program)))?;
        // The child holds its own copy of the terminal; keeping ours would hide its exit.
        // From here on the guard kills the child if anything below gives up on it.
        drop(pts);
        info!(pid = ?child.id(), program = %self.program, target = %request.target, "Spawned target process.");
        let (reader, writer) = pty.into_split();
        let mut writer = PtyWriter(writer);
        // Resizing only works once the child owns the terminal.
        if let Some(terminal) = request.terminal.as_ref()
            && let Err(error) = writer.resize(terminal.size)
        {
            warn!(%error, size = %terminal.size, "Failed to size target terminal.");
        }
        Ok(TargetSession::new(
            Box::new(reader),
            Box::new(writer),
            Box::new(ChildGuard(child)),
        ))
    }
}

struct PtyWriter(OwnedWritePty);

impl AsyncWrite for PtyWriter {
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

impl TargetWriter for PtyWriter {
    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.0.resize(size.into()).map_err(io::Error::other)
    }
}

// Kills the child when released, or when dropped without being released.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        // Already reaped after a release.
        let _ = self.0.start_kill();
    }
}

#[async_trait]
impl TargetGuard for ChildGuard {
    async fn release(mut self: Box<Self>) -> Option<u32> {
        // The process may already be gone, in which case there's nothing to kill.
        if let Err(error) = self.0.start_kill() {
            debug!(%error, "Target process already exited.");
        }
        match self.0.wait().await {
            Ok(status) => status
                .code()
                .or_else(|| status.signal().map(|signal| 128 + signal))
                .map(|code| code as u32),
            Err(error) => {
                warn!(%error, "Unable to reap target process.");
                None
            }
        }
    }
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use metrics::{counter, gauge};
use russh::{
    Channel,
    server::{Handle, Msg},
};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::StreamBridge,
    error::GatewayError,
    ssh::{
        auth::AuthorizedSession,
        state::{SessionState, SessionStatus},
    },
    target::{ConnectError, TargetConnector, TargetRequest, TerminalRequest, TerminalSize},
    telemetry::{
        TELEMETRY_COUNTER_NEGOTIATION_TIMEOUTS, TELEMETRY_COUNTER_TARGET_CONNECT_FAILURES,
        TELEMETRY_GAUGE_ACTIVE_BRIDGES, TELEMETRY_KEY_REASON,
    },
};

// Shown on the client's stderr when the target can't be reached. Deliberately vague.
const TARGET_UNAVAILABLE_MESSAGE: &[u8] = b"lighthouse: target unavailable\r\n";

/// What the client asked for on its session channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct InteractiveRequest {
    pub(crate) terminal: Option<TerminalRequest>,
    pub(crate) command: Option<String>,
}

/// A channel request relevant to starting the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NegotiationEvent {
    Terminal(TerminalRequest),
    Shell,
    Exec(String),
}

/// Forwards the client's pty, shell, and exec requests to the session task.
///
/// A terminal request starts negotiation and is kept for the target. The first shell or
/// exec request completes it; anything after that is acknowledged without effect.
pub(crate) struct NegotiationGate {
    sender: Option<mpsc::UnboundedSender<NegotiationEvent>>,
}

impl NegotiationGate {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<NegotiationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            NegotiationGate {
                sender: Some(sender),
            },
            receiver,
        )
    }

    // Returns whether the session task received the event.
    fn send(&mut self, event: NegotiationEvent) -> bool {
        let completes = !matches!(event, NegotiationEvent::Terminal(_));
        let delivered = match self.sender.as_ref() {
            // The receiver may be gone if negotiation already timed out.
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };
        if completes || !delivered {
            self.sender = None;
        }
        delivered
    }

    pub(crate) fn pty(&mut self, terminal: TerminalRequest) -> bool {
        self.send(NegotiationEvent::Terminal(terminal))
    }

    pub(crate) fn shell(&mut self) -> bool {
        self.send(NegotiationEvent::Shell)
    }

    pub(crate) fn exec(&mut self, command: String) -> bool {
        self.send(NegotiationEvent::Exec(command))
    }
}

/// How negotiation on a channel ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Negotiated {
    Ready(InteractiveRequest),
    TimedOut,
    // The protocol handler went away along with the connection.
    Abandoned,
}

/// Wait for the client's interactive request until `deadline`.
///
/// A terminal alone starts the session as a shell when nothing else arrives in time.
pub(crate) async fn negotiate(
    events: &mut mpsc::UnboundedReceiver<NegotiationEvent>,
    deadline: Instant,
) -> Negotiated {
    let mut request = InteractiveRequest::default();
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(NegotiationEvent::Terminal(terminal))) => request.terminal = Some(terminal),
            Ok(Some(NegotiationEvent::Shell)) => return Negotiated::Ready(request),
            Ok(Some(NegotiationEvent::Exec(command))) => {
                request.command = Some(command);
                return Negotiated::Ready(request);
            }
            Ok(None) => return Negotiated::Abandoned,
            Err(_) if request.terminal.is_some() => return Negotiated::Ready(request),
            Err(_) => return Negotiated::TimedOut,
        }
    }
}

/// Everything the session task owns once the client opened its channel.
pub(crate) struct SessionTask {
    pub(crate) peer: SocketAddr,
    pub(crate) status: SessionStatus,
    pub(crate) authorized: AuthorizedSession,
    pub(crate) channel: Channel<Msg>,
    pub(crate) handle: Handle,
    pub(crate) negotiation: mpsc::UnboundedReceiver<NegotiationEvent>,
    pub(crate) resize: watch::Receiver<Option<TerminalSize>>,
    pub(crate) connector: Arc<dyn TargetConnector>,
    pub(crate) bridge: StreamBridge,
    pub(crate) negotiation_timeout: Duration,
    pub(crate) target_connect_timeout: Duration,
    pub(crate) cancellation_token: CancellationToken,
}

fn connect_failure_reason(error: &ConnectError) -> &'static str {
    match error {
        ConnectError::UnknownTarget(_) => "unknown_target",
        ConnectError::Allocate(_) => "allocate",
        ConnectError::Spawn(_) => "spawn",
        ConnectError::Unreachable(_) => "unreachable",
        ConnectError::Rejected(_) => "rejected",
        ConnectError::Timeout => "timeout",
    }
}

impl SessionTask {
    /// Wait for the interactive request, open the target, and relay until either side ends.
    ///
    /// The connection is cancelled on return, whichever way the session ended.
    pub(crate) async fn run(self) {
        let SessionTask {
            peer,
            status,
            authorized,
            channel,
            handle,
            mut negotiation,
            resize,
            connector,
            bridge,
            negotiation_timeout,
            target_connect_timeout,
            cancellation_token,
        } = self;
        let channel_id = channel.id();
        let target = authorized.routing.target.clone();

        let deadline = Instant::now() + negotiation_timeout;
        let negotiated = tokio::select! {
            negotiated = negotiate(&mut negotiation, deadline) => negotiated,
            _ = cancellation_token.cancelled() => {
                status.transition(SessionState::Closed);
                return;
            }
        };
        let request = match negotiated {
            Negotiated::Ready(request) => request,
            Negotiated::Abandoned => {
                status.transition(SessionState::Closed);
                cancellation_token.cancel();
                return;
            }
            Negotiated::TimedOut => {
                let error = GatewayError::NegotiationTimeout;
                #[cfg(not(coverage_nightly))]
                tracing::warn!(%peer, %target, reason = error.reason(), "No interactive request received in time.");
                counter!(TELEMETRY_COUNTER_NEGOTIATION_TIMEOUTS).increment(1);
                status.transition(SessionState::NegotiationTimeout);
                let _ = handle.close(channel_id).await;
                status.transition(SessionState::Closed);
                cancellation_token.cancel();
                return;
            }
        };
        // Later requests on the channel no longer reach the session.
        drop(negotiation);
        status.transition(SessionState::ReadyToBridge);

        let target_request = TargetRequest {
            identity: authorized.identity.clone(),
            target: target.clone(),
            terminal: request.terminal,
            command: request.command,
        };
        let connected = match timeout(target_connect_timeout, connector.connect(&target_request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        };
        let mut target_session = match connected {
            Ok(session) => session,
            Err(error) => {
                let reason = connect_failure_reason(&error);
                let error = GatewayError::from(error);
                #[cfg(not(coverage_nightly))]
                tracing::error!(%peer, %target, identity = %authorized.identity.id, %error, "Unable to connect to target.");
                counter!(TELEMETRY_COUNTER_TARGET_CONNECT_FAILURES, TELEMETRY_KEY_REASON => reason)
                    .increment(1);
                let _ = channel
                    .extended_data(1, TARGET_UNAVAILABLE_MESSAGE)
                    .await;
                let _ = channel.eof().await;
                let _ = channel.close().await;
                status.transition(SessionState::Closed);
                cancellation_token.cancel();
                return;
            }
        };

        status.transition(SessionState::Bridging);
        #[cfg(not(coverage_nightly))]
        tracing::info!(%peer, %target, identity = %authorized.identity.id, "Bridge started.");
        let active = gauge!(TELEMETRY_GAUGE_ACTIVE_BRIDGES);
        active.increment(1);
        let summary = bridge
            .run(
                channel.into_stream(),
                &mut target_session,
                resize,
                cancellation_token.clone(),
            )
            .await;
        let exit_status = target_session.release().await;
        active.decrement(1);
        #[cfg(not(coverage_nightly))]
        tracing::info!(
            %peer,
            %target,
            identity = %authorized.identity.id,
            end = %summary.end,
            client_to_target = summary.client_to_target,
            target_to_client = summary.target_to_client,
            ?exit_status,
            "Bridge stopped."
        );
        // Terminals report EIO once their process is gone, so this is usually benign.
        #[cfg(not(coverage_nightly))]
        if let Some(error) = summary.error.as_ref() {
            tracing::debug!(%peer, %target, reason = error.reason(), %error, "Relay ended on an I/O error.");
        }

        if let Some(exit_status) = exit_status {
            let _ = handle.exit_status_request(channel_id, exit_status).await;
        }
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
        status.transition(SessionState::Closed);
        cancellation_token.cancel();
    }
}

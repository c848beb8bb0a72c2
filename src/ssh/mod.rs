use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, atomic::Ordering},
};

mod auth;
mod session;
mod state;

pub use state::SessionState;

pub(crate) use self::auth::Authorizer;
use crate::{
    GatewayServer,
    droppable_handle::DroppableHandle,
    fingerprints::KeyFingerprint,
    ssh::{
        auth::AuthorizedSession,
        session::{NegotiationGate, SessionTask},
        state::SessionStatus,
    },
    target::{TerminalRequest, TerminalSize},
    telemetry::{TELEMETRY_COUNTER_AUTH_FAILURES, TELEMETRY_KEY_REASON},
};

use metrics::counter;
use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    keys::PublicKey,
    server::{Auth, Handler, Msg, Session},
};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

/// Slot holding the task that owns a connection's bridge, so the connection can wait on it.
pub(crate) type SessionTaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

// Per-connection protocol handler.
pub(crate) struct GatewayHandler {
    // The unique ID of this connection.
    id: usize,
    // The IP and port of this connection.
    peer: SocketAddr,
    // Cancelling this token disconnects the client.
    cancellation_token: CancellationToken,
    status: SessionStatus,
    // Set once a public key attempt is accepted, and never changed afterwards.
    authorized: Option<AuthorizedSession>,
    // Disconnects the client if authentication takes too long. Dropped once authenticated.
    authentication_timer: Option<DroppableHandle<()>>,
    // The single session channel, once opened.
    channel_id: Option<ChannelId>,
    gate: Option<NegotiationGate>,
    resize: watch::Sender<Option<TerminalSize>>,
    session_task: SessionTaskSlot,
    server: Arc<GatewayServer>,
}

impl GatewayHandler {
    pub(crate) fn session_task(&self) -> SessionTaskSlot {
        Arc::clone(&self.session_task)
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    fn is_session_channel(&self, channel: ChannelId) -> bool {
        self.channel_id == Some(channel)
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

pub(crate) trait Server {
    fn new_client(
        &self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> GatewayHandler;
}

impl Server for Arc<GatewayServer> {
    // Create a new handler for the SSH connection.
    fn new_client(
        &self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> GatewayHandler {
        let id = self.session_id.fetch_add(1, Ordering::AcqRel);
        #[cfg(not(coverage_nightly))]
        tracing::info!(peer = %peer_address, id, "SSH client connected.");
        let authentication_timeout = self.authentication_timeout;
        let timer_token = cancellation_token.clone();
        let authentication_timer = DroppableHandle(tokio::spawn(async move {
            sleep(authentication_timeout).await;
            #[cfg(not(coverage_nightly))]
            tracing::info!(peer = %peer_address, "Authentication timed out.");
            timer_token.cancel();
        }));
        let status = SessionStatus::new(peer_address);
        status.transition(SessionState::Authenticating);
        let (resize, _) = watch::channel(None);
        GatewayHandler {
            id,
            peer: peer_address,
            cancellation_token,
            status,
            authorized: None,
            authentication_timer: Some(authentication_timer),
            channel_id: None,
            gate: None,
            resize,
            session_task: Arc::new(Mutex::new(None)),
            server: Arc::clone(self),
        }
    }
}

impl Handler for GatewayHandler {
    type Error = russh::Error;

    // Only public keys are ever accepted.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Passwords are refused outright, without looking at them.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, _password), fields(peer = %self.peer), level = "debug")
    )]
    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::warn!(peer = %self.peer, %user, "Rejected password authentication.");
        counter!(TELEMETRY_COUNTER_AUTH_FAILURES, TELEMETRY_KEY_REASON => "password").increment(1);
        Ok(Self::reject())
    }

    // Resolve the key and check that its identity may reach the requested target.
    // Unknown keys and denied targets look the same to the client.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, public_key), fields(peer = %self.peer), level = "debug")
    )]
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.authorized.is_some() {
            return Ok(Self::reject());
        }
        self.status.transition(SessionState::Authenticating);
        let fingerprint = KeyFingerprint::from(public_key);
        match self.server.authorizer.authorize(user, &fingerprint).await {
            Ok(authorized) => {
                #[cfg(not(coverage_nightly))]
                tracing::info!(
                    peer = %self.peer,
                    %user,
                    %fingerprint,
                    identity = %authorized.identity.id,
                    target = %authorized.routing.target,
                    "SSH client authenticated with public key."
                );
                self.authorized = Some(authorized);
                self.authentication_timer = None;
                self.status.transition(SessionState::Authenticated);
                Ok(Auth::Accept)
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(
                    peer = %self.peer,
                    %user,
                    %fingerprint,
                    reason = error.reason(),
                    %error,
                    "Rejected public key authentication."
                );
                counter!(TELEMETRY_COUNTER_AUTH_FAILURES, TELEMETRY_KEY_REASON => error.reason())
                    .increment(1);
                self.status.transition(SessionState::AuthFailed);
                Ok(Self::reject())
            }
        }
    }

    // Accept the first session channel and start waiting for the client's request on it.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(authorized) = self.authorized.clone() else {
            return Err(russh::Error::Disconnect);
        };
        // Only one session channel per connection.
        if self.channel_id.is_some() {
            #[cfg(not(coverage_nightly))]
            tracing::debug!(peer = %self.peer, "Rejecting additional session channel.");
            return Ok(false);
        }
        self.channel_id = Some(channel.id());
        self.status.transition(SessionState::ChannelOpen);
        let (gate, negotiation) = NegotiationGate::new();
        self.gate = Some(gate);
        let task = SessionTask {
            peer: self.peer,
            status: self.status.clone(),
            authorized,
            channel,
            handle: session.handle(),
            negotiation,
            resize: self.resize.subscribe(),
            connector: Arc::clone(&self.server.target_connector),
            bridge: self.server.bridge.clone(),
            negotiation_timeout: self.server.negotiation_timeout,
            target_connect_timeout: self.server.target_connect_timeout,
            cancellation_token: self.cancellation_token.clone(),
        };
        let join_handle = tokio::spawn(task.run());
        *self.session_task.lock().expect("not poisoned") = Some(join_handle);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, %term, col_width, row_height, "Received pty_request.");
        if !self.is_session_channel(channel) {
            return session.channel_failure(channel);
        }
        let Some(gate) = self.gate.as_mut() else {
            return session.channel_failure(channel);
        };
        let size = TerminalSize::from_ssh(col_width, row_height);
        self.resize.send_replace(Some(size));
        gate.pty(TerminalRequest {
            term: term.into(),
            size,
        });
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, "Received shell_request.");
        if !self.is_session_channel(channel) {
            return session.channel_failure(channel);
        }
        let Some(gate) = self.gate.as_mut() else {
            return session.channel_failure(channel);
        };
        gate.shell();
        session.channel_success(channel)
    }

    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, session), fields(peer = %self.peer), level = "debug")
    )]
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel) {
            return session.channel_failure(channel);
        }
        let Some(gate) = self.gate.as_mut() else {
            return session.channel_failure(channel);
        };
        let command = String::from_utf8_lossy(data).into_owned();
        if !gate.exec(command) {
            // A shell or command already started the session on this channel.
            #[cfg(not(coverage_nightly))]
            tracing::debug!(peer = %self.peer, "Ignoring exec request on started session.");
        }
        session.channel_success(channel)
    }

    // Forward changes to the client's window size to the target.
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel) {
            return session.channel_failure(channel);
        }
        self.resize
            .send_replace(Some(TerminalSize::from_ssh(col_width, row_height)));
        session.channel_success(channel)
    }
}

impl Drop for GatewayHandler {
    fn drop(&mut self) {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, id = self.id, state = %self.status.get(), "Dropping SSH handler.");
    }
}

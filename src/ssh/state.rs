use std::{
    fmt::Display,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

/// Lifecycle of one gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    AuthFailed,
    Authenticated,
    ChannelOpen,
    NegotiationTimeout,
    ReadyToBridge,
    Bridging,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::AuthFailed | SessionState::NegotiationTimeout | SessionState::Closed
        )
    }

    // Whether `next` is reachable from `self` in one step.
    fn can_become(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closed) => true,
            (Connected, Authenticating) => true,
            // A client may try several keys before one is accepted.
            (Authenticating | AuthFailed, Authenticating | AuthFailed | Authenticated) => true,
            (Authenticated, ChannelOpen) => true,
            (ChannelOpen, NegotiationTimeout | ReadyToBridge) => true,
            (ReadyToBridge, Bridging) => true,
            _ => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::AuthFailed => "auth_failed",
            SessionState::Authenticated => "authenticated",
            SessionState::ChannelOpen => "channel_open",
            SessionState::NegotiationTimeout => "negotiation_timeout",
            SessionState::ReadyToBridge => "ready_to_bridge",
            SessionState::Bridging => "bridging",
            SessionState::Closed => "closed",
        })
    }
}

/// Current state of a connection, shared between its protocol handler and its bridge task.
#[derive(Debug, Clone)]
pub(crate) struct SessionStatus {
    peer: SocketAddr,
    state: Arc<Mutex<SessionState>>,
}

impl SessionStatus {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        SessionStatus {
            peer,
            state: Arc::new(Mutex::new(SessionState::Connected)),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.state.lock().expect("not poisoned")
    }

    /// Move to `next`, returning whether the transition was taken.
    ///
    /// A closed session stays closed; other out-of-order transitions are ignored.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().expect("not poisoned");
        if *state == next {
            return true;
        }
        if *state == SessionState::Closed || !state.can_become(next) {
            #[cfg(not(coverage_nightly))]
            tracing::debug!(peer = %self.peer, from = %*state, to = %next, "Ignoring session transition.");
            return false;
        }
        #[cfg(not(coverage_nightly))]
        tracing::debug!(peer = %self.peer, from = %*state, to = %next, "Session transition.");
        *state = next;
        true
    }
}

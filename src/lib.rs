#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use bon::bon;

use crate::{bridge::DEFAULT_BUFFER_SIZE, ssh::Authorizer};

pub use crate::{
    access::{AccessPolicy, FileAccessPolicy},
    bridge::{BridgeEnd, BridgeSummary, StreamBridge},
    config::{ApplicationConfig, TargetConnectorKind},
    entrypoint::entrypoint,
    error::GatewayError,
    fingerprints::KeyFingerprint,
    host_key::load_or_create,
    identity::{DirectoryIdentityResolver, Identity, IdentityResolver},
    listener::serve,
    routing::RoutingUsername,
    ssh::SessionState,
    target::{
        ConnectError, SshConnector, SshTarget, TargetConnector, TargetGuard, TargetRequest,
        TargetSession, TargetWriter, TerminalRequest, TerminalSize,
    },
};

#[cfg(unix)]
pub use crate::target::CommandConnector;

mod access;
mod bridge;
mod config;
mod droppable_handle;
mod entrypoint;
mod error;
mod fingerprints;
mod host_key;
mod identity;
mod listener;
mod routing;
mod ssh;
mod target;
mod telemetry;

pub(crate) const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every connection to the gateway.
pub struct GatewayServer {
    // Counter for assigning connection IDs.
    pub(crate) session_id: AtomicUsize,
    // Resolves keys and checks grants for each authentication attempt.
    pub(crate) authorizer: Authorizer,
    // Opens the outbound leg of each session.
    pub(crate) target_connector: Arc<dyn TargetConnector>,
    // Relay shared by all sessions.
    pub(crate) bridge: StreamBridge,
    // Time until an unauthenticated connection is dropped.
    pub(crate) authentication_timeout: Duration,
    // Time allowed between opening a session channel and requesting a shell, command, or terminal.
    pub(crate) negotiation_timeout: Duration,
    // Time until a connection attempt to a target is abandoned.
    pub(crate) target_connect_timeout: Duration,
}

#[bon]
impl GatewayServer {
    #[builder]
    pub fn new(
        identity_resolver: Arc<dyn IdentityResolver>,
        access_policy: Arc<dyn AccessPolicy>,
        target_connector: Arc<dyn TargetConnector>,
        #[builder(default = DEFAULT_AUTHENTICATION_TIMEOUT)] authentication_timeout: Duration,
        #[builder(default = DEFAULT_NEGOTIATION_TIMEOUT)] negotiation_timeout: Duration,
        #[builder(default = DEFAULT_TARGET_CONNECT_TIMEOUT)] target_connect_timeout: Duration,
        #[builder(default = DEFAULT_BUFFER_SIZE)] buffer_size: usize,
    ) -> Self {
        GatewayServer {
            session_id: AtomicUsize::new(0),
            authorizer: Authorizer::new(identity_resolver, access_policy),
            target_connector,
            bridge: StreamBridge::builder().buffer_size(buffer_size).build(),
            authentication_timeout,
            negotiation_timeout,
            target_connect_timeout,
        }
    }
}

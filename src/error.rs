use std::path::PathBuf;

use crate::target::ConnectError;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Invalid file path")]
    InvalidFilePath,
    #[error("Missing directory {0}")]
    MissingDirectory(PathBuf),
    #[cfg(not(unix))]
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid target command template")]
    InvalidTargetCommand,
}

// Everything that can end a single gateway session.
// None of these ever leave the session that produced them.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("Unknown or inactive key")]
    AuthenticationFailure,
    #[error("Identity {identity} is not allowed to reach {target}")]
    AuthorizationFailure { identity: String, target: String },
    #[error("No interactive request received in time")]
    NegotiationTimeout,
    #[error(transparent)]
    TargetConnect(#[from] ConnectError),
    #[error("Relay error: {0}")]
    RelayIo(#[from] std::io::Error),
}

impl GatewayError {
    // Stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::ProtocolViolation(_) => "protocol_violation",
            GatewayError::AuthenticationFailure => "unknown_key",
            GatewayError::AuthorizationFailure { .. } => "target_not_allowed",
            GatewayError::NegotiationTimeout => "negotiation_timeout",
            GatewayError::TargetConnect(_) => "target_connect",
            GatewayError::RelayIo(_) => "relay_io",
        }
    }
}

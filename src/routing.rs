use std::fmt::Display;

use crate::error::GatewayError;

/// Routing intent decoded from an SSH username of the form `<target>/<identity-label>`.
///
/// The identity label is advisory: authentication is decided by the presented key alone,
/// and the label is only carried along for logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingUsername {
    pub target: String,
    pub identity_label: String,
}

impl RoutingUsername {
    /// Split `user` on its only `/`. No trimming or normalization is applied to either half.
    pub fn parse(user: &str) -> Result<Self, GatewayError> {
        let Some((target, identity_label)) = user.split_once('/') else {
            return Err(GatewayError::ProtocolViolation("username has no routing separator"));
        };
        if identity_label.contains('/') {
            return Err(GatewayError::ProtocolViolation(
                "username has more than one routing separator",
            ));
        }
        if target.is_empty() || identity_label.is_empty() {
            return Err(GatewayError::ProtocolViolation("username has an empty routing part"));
        }
        Ok(RoutingUsername {
            target: target.into(),
            identity_label: identity_label.into(),
        })
    }
}

impl Display for RoutingUsername {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.target, self.identity_label)
    }
}

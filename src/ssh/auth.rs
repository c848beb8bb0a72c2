use std::sync::Arc;

use crate::{
    access::AccessPolicy,
    error::GatewayError,
    fingerprints::KeyFingerprint,
    identity::{Identity, IdentityResolver},
    routing::RoutingUsername,
};

/// Outcome of a successful public key attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthorizedSession {
    pub(crate) routing: RoutingUsername,
    pub(crate) identity: Identity,
}

// Decides a single public key attempt. Every call queries both collaborators afresh.
#[derive(Clone)]
pub(crate) struct Authorizer {
    resolver: Arc<dyn IdentityResolver>,
    policy: Arc<dyn AccessPolicy>,
}

impl Authorizer {
    pub(crate) fn new(resolver: Arc<dyn IdentityResolver>, policy: Arc<dyn AccessPolicy>) -> Self {
        Authorizer { resolver, policy }
    }

    pub(crate) async fn authorize(
        &self,
        user: &str,
        fingerprint: &KeyFingerprint,
    ) -> Result<AuthorizedSession, GatewayError> {
        let routing = RoutingUsername::parse(user)?;
        let identity = match self.resolver.resolve(fingerprint).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return Err(GatewayError::AuthenticationFailure),
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::error!(%fingerprint, %error, "Identity lookup failed.");
                return Err(GatewayError::AuthenticationFailure);
            }
        };
        if !self.policy.is_allowed(&identity, &routing.target).await {
            return Err(GatewayError::AuthorizationFailure {
                identity: identity.id,
                target: routing.target,
            });
        }
        if identity.label != routing.identity_label {
            #[cfg(not(coverage_nightly))]
            tracing::info!(
                identity = %identity.id,
                label = %identity.label,
                claimed = %routing.identity_label,
                "Username label differs from resolved identity."
            );
        }
        // Best effort; the decision above stands whether or not this lands.
        let resolver = Arc::clone(&self.resolver);
        let usage_identity = identity.clone();
        let usage_fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            if let Err(error) = resolver
                .record_usage(&usage_identity, &usage_fingerprint)
                .await
            {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(identity = %usage_identity.id, %error, "Unable to record key usage.");
            }
        });
        Ok(AuthorizedSession { routing, identity })
    }
}

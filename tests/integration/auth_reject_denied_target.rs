use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use russh::client::AuthResult;

use crate::common::{
    DuplexConnector, MemoryIdentities, MemoryPolicy, authenticate, connect, generate_key,
    identity, start_gateway,
};

/// This test ensures that a known key asking for a target it wasn't granted fails
/// exactly like an unknown key does, and that no target is ever contacted.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_reject_denied_target() {
    // 1. Start the gateway with bob allowed only on staging-node
    let bob = generate_key();
    let stranger = generate_key();
    let identities = Arc::new(MemoryIdentities::default().with(&bob, identity("bob")));
    let policy = Arc::new(MemoryPolicy::default().grant("bob", "staging-node"));
    let (connector, _opened) = DuplexConnector::new(None);
    let connector = Arc::new(connector);
    let gateway = start_gateway(
        Arc::clone(&identities),
        Arc::clone(&policy),
        connector.clone(),
        Duration::from_secs(10),
    )
    .await;

    // 2. Try to reach a target outside of bob's grants
    let mut session = connect(gateway.address).await;
    let denied = authenticate(&mut session, "prod-db/bob", &bob).await;
    assert!(!denied.success(), "denied target was authorized");
    assert_eq!(policy.calls.load(Ordering::SeqCst), 1);

    // 3. Try an unknown key on the same target
    let mut session = connect(gateway.address).await;
    let unknown = authenticate(&mut session, "prod-db/bob", &stranger).await;
    assert!(!unknown.success(), "unknown key was authorized");
    // Unknown keys never reach the policy
    assert_eq!(policy.calls.load(Ordering::SeqCst), 1);

    // 4. Both failures look the same to the client
    match (denied, unknown) {
        (
            AuthResult::Failure {
                remaining_methods: denied_methods,
                partial_success: denied_partial,
            },
            AuthResult::Failure {
                remaining_methods: unknown_methods,
                partial_success: unknown_partial,
            },
        ) => {
            assert_eq!(denied_methods, unknown_methods);
            assert_eq!(denied_partial, unknown_partial);
        }
        _ => panic!("unexpected AuthResult"),
    }
    assert_eq!(identities.resolve_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
}

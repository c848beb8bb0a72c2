use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use crate::common::{
    FAILING_CONNECTOR_DETAIL, FailingConnector, MemoryIdentities, MemoryPolicy, authenticate,
    connect, generate_key, identity, open_shell, read_until_closed, start_gateway,
    wait_for_disconnect,
};

/// This test ensures that a target that can't be reached ends the session with a generic
/// message, without leaking the connector's error or the connection.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_target_connect_failure() {
    // 1. Start the gateway with a connector that always fails
    let key = generate_key();
    let identities = Arc::new(MemoryIdentities::default().with(&key, identity("alice")));
    let policy = Arc::new(MemoryPolicy::default().grant("alice", "build-node"));
    let connector = Arc::new(FailingConnector::default());
    let gateway = start_gateway(
        identities,
        policy,
        connector.clone(),
        Duration::from_secs(10),
    )
    .await;

    // 2. Request a shell
    let mut session = connect(gateway.address).await;
    assert!(
        authenticate(&mut session, "build-node/alice", &key)
            .await
            .success()
    );
    let mut channel = open_shell(&session).await;

    // 3. The client only sees a generic message before the channel closes
    let outcome = read_until_closed(&mut channel).await;
    assert!(outcome.data.is_empty());
    assert_eq!(outcome.stderr, b"lighthouse: target unavailable\r\n");
    assert!(
        !String::from_utf8_lossy(&outcome.stderr).contains(FAILING_CONNECTOR_DETAIL),
        "connector error leaked to the client"
    );
    assert_eq!(outcome.exit_status, None);

    // 4. The connection is torn down after a single attempt
    wait_for_disconnect(&session).await;
    assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
}

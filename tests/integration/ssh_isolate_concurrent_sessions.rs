use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{
    DuplexConnector, MemoryIdentities, MemoryPolicy, authenticate, connect, generate_key,
    identity, next_target, open_shell, read_data, read_until_closed, start_gateway,
};

/// This test ensures that concurrent sessions each get their own target, and that
/// ending one doesn't affect the other.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_isolate_concurrent_sessions() {
    // 1. Start the gateway with two users on different targets
    let alice = generate_key();
    let bob = generate_key();
    let identities = Arc::new(
        MemoryIdentities::default()
            .with(&alice, identity("alice"))
            .with(&bob, identity("bob")),
    );
    let policy = Arc::new(
        MemoryPolicy::default()
            .grant("alice", "build-node")
            .grant("bob", "staging-node"),
    );
    let (connector, mut opened) = DuplexConnector::new(None);
    let gateway = start_gateway(
        identities,
        policy,
        Arc::new(connector),
        Duration::from_secs(10),
    )
    .await;

    // 2. Bridge both sessions, one after the other
    let mut alice_session = connect(gateway.address).await;
    assert!(
        authenticate(&mut alice_session, "build-node/alice", &alice)
            .await
            .success()
    );
    let mut alice_channel = open_shell(&alice_session).await;
    let alice_target = next_target(&mut opened).await;
    assert_eq!(alice_target.request.target, "build-node");
    assert_eq!(alice_target.request.identity, identity("alice"));

    let mut bob_session = connect(gateway.address).await;
    assert!(
        authenticate(&mut bob_session, "staging-node/bob", &bob)
            .await
            .success()
    );
    let mut bob_channel = open_shell(&bob_session).await;
    let mut bob_target = next_target(&mut opened).await;
    assert_eq!(bob_target.request.target, "staging-node");
    assert_eq!(bob_target.request.identity, identity("bob"));

    // 3. End alice's session from the target side
    drop(alice_target);
    read_until_closed(&mut alice_channel).await;

    // 4. Bob's session still works in both directions
    bob_channel.data(&b"whoami\n"[..]).await.unwrap();
    let mut buf = [0u8; 7];
    tokio::time::timeout(Duration::from_secs(5), bob_target.stream.read_exact(&mut buf))
        .await
        .expect("timeout waiting for bob's input")
        .unwrap();
    assert_eq!(&buf, b"whoami\n");
    bob_target.stream.write_all(b"bob\r\n").await.unwrap();
    read_data(&mut bob_channel, b"bob\r\n").await;
}

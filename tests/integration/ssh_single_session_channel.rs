use std::{sync::Arc, time::Duration};

use crate::common::{
    DuplexConnector, MemoryIdentities, MemoryPolicy, authenticate, connect, generate_key,
    identity, start_gateway,
};

/// This test ensures that a connection can only open a single session channel.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_single_session_channel() {
    let key = generate_key();
    let identities = Arc::new(MemoryIdentities::default().with(&key, identity("alice")));
    let policy = Arc::new(MemoryPolicy::default().grant("alice", "build-node"));
    let (connector, _opened) = DuplexConnector::new(None);
    let gateway = start_gateway(
        identities,
        policy,
        Arc::new(connector),
        Duration::from_secs(10),
    )
    .await;

    let mut session = connect(gateway.address).await;
    assert!(
        authenticate(&mut session, "build-node/alice", &key)
            .await
            .success()
    );
    let _channel = session
        .channel_open_session()
        .await
        .expect("first channel should open");
    assert!(
        session.channel_open_session().await.is_err(),
        "second session channel was opened"
    );
}

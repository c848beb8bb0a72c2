use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use lighthouse::{
    AccessPolicy, ConnectError, GatewayServer, Identity, IdentityResolver, KeyFingerprint,
    TargetConnector, TargetGuard, TargetRequest, TargetSession, serve,
};
use rand::{Rng, SeedableRng, rng, seq::IndexedRandom};
use rand_chacha::ChaCha20Rng;
use russh::{
    ChannelMsg, MethodKind, MethodSet,
    client::{self, AuthResult, Handle, Msg},
    keys::{PrivateKey, key::PrivateKeyWithHashAlg, ssh_key::private::Ed25519Keypair},
    server::Config,
};
use tokio::{
    io::DuplexStream,
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub(crate) struct LighthouseHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for LighthouseHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) fn random_name() -> String {
    String::from_utf8(
        (0..6)
            .flat_map(|_| {
                "0123456789abcdefghijklmnopqrstuvwxyz"
                    .as_bytes()
                    .choose(&mut rng())
                    .copied()
            })
            .collect(),
    )
    .unwrap()
}

pub(crate) fn generate_key() -> PrivateKey {
    PrivateKey::from(Ed25519Keypair::from_seed(
        &ChaCha20Rng::from_os_rng().random(),
    ))
}

pub(crate) fn identity(id: &str) -> Identity {
    Identity {
        id: id.into(),
        label: id.into(),
    }
}

/// In-memory identity store that counts lookups.
#[derive(Default)]
pub(crate) struct MemoryIdentities {
    identities: HashMap<KeyFingerprint, Identity>,
    pub(crate) resolve_calls: AtomicUsize,
}

impl MemoryIdentities {
    pub(crate) fn with(mut self, key: &PrivateKey, identity: Identity) -> Self {
        self.identities
            .insert(KeyFingerprint::from(key.public_key()), identity);
        self
    }
}

#[async_trait]
impl IdentityResolver for MemoryIdentities {
    async fn resolve(&self, fingerprint: &KeyFingerprint) -> color_eyre::Result<Option<Identity>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.identities.get(fingerprint).cloned())
    }

    async fn record_usage(
        &self,
        _identity: &Identity,
        _fingerprint: &KeyFingerprint,
    ) -> color_eyre::Result<()> {
        Ok(())
    }
}

/// In-memory grants of exact targets, counting decisions.
#[derive(Default)]
pub(crate) struct MemoryPolicy {
    grants: HashMap<String, Vec<String>>,
    pub(crate) calls: AtomicUsize,
}

impl MemoryPolicy {
    pub(crate) fn grant(mut self, identity: &str, target: &str) -> Self {
        self.grants
            .entry(identity.into())
            .or_default()
            .push(target.into());
        self
    }
}

#[async_trait]
impl AccessPolicy for MemoryPolicy {
    async fn is_allowed(&self, identity: &Identity, target: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.grants
            .get(&identity.id)
            .is_some_and(|targets| targets.iter().any(|granted| granted == target))
    }
}

/// The far end of a session opened by [`DuplexConnector`].
pub(crate) struct OpenedTarget {
    pub(crate) request: TargetRequest,
    pub(crate) stream: DuplexStream,
}

struct CountingGuard {
    released: Arc<AtomicUsize>,
    exit_status: Option<u32>,
}

#[async_trait]
impl TargetGuard for CountingGuard {
    async fn release(self: Box<Self>) -> Option<u32> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.exit_status
    }
}

/// Connector handing the far end of an in-memory stream to the test for every session.
pub(crate) struct DuplexConnector {
    opened: mpsc::UnboundedSender<OpenedTarget>,
    pub(crate) calls: AtomicUsize,
    pub(crate) released: Arc<AtomicUsize>,
    exit_status: Option<u32>,
}

impl DuplexConnector {
    pub(crate) fn new(exit_status: Option<u32>) -> (Self, mpsc::UnboundedReceiver<OpenedTarget>) {
        let (opened, receiver) = mpsc::unbounded_channel();
        (
            DuplexConnector {
                opened,
                calls: AtomicUsize::new(0),
                released: Arc::new(AtomicUsize::new(0)),
                exit_status,
            },
            receiver,
        )
    }
}

#[async_trait]
impl TargetConnector for DuplexConnector {
    async fn connect(&self, request: &TargetRequest) -> Result<TargetSession, ConnectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(4096);
        self.opened
            .send(OpenedTarget {
                request: request.clone(),
                stream: far,
            })
            .map_err(|error| ConnectError::Allocate(error.to_string()))?;
        Ok(TargetSession::from_stream(
            near,
            Some(Box::new(CountingGuard {
                released: Arc::clone(&self.released),
                exit_status: self.exit_status,
            })),
        ))
    }
}

/// Connector whose every attempt fails with a detailed error the client must never see.
#[derive(Default)]
pub(crate) struct FailingConnector {
    pub(crate) calls: AtomicUsize,
}

pub(crate) const FAILING_CONNECTOR_DETAIL: &str = "10.0.0.5:22: connection refused";

#[async_trait]
impl TargetConnector for FailingConnector {
    async fn connect(&self, _request: &TargetRequest) -> Result<TargetSession, ConnectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConnectError::Unreachable(FAILING_CONNECTOR_DETAIL.into()))
    }
}

/// Gateway serving on a random local port; stops when dropped.
pub(crate) struct TestGateway {
    pub(crate) address: SocketAddr,
    _shutdown: tokio_util::sync::DropGuard,
    _handle: LighthouseHandle,
}

pub(crate) async fn start_gateway(
    identities: Arc<MemoryIdentities>,
    policy: Arc<MemoryPolicy>,
    connector: Arc<dyn TargetConnector>,
    negotiation_timeout: Duration,
) -> TestGateway {
    let server = Arc::new(
        GatewayServer::builder()
            .identity_resolver(identities)
            .access_policy(policy)
            .target_connector(connector)
            .negotiation_timeout(negotiation_timeout)
            .build(),
    );
    let config = Arc::new(Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
        keys: vec![generate_key()],
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = LighthouseHandle(tokio::spawn(serve(
        listener,
        config,
        server,
        shutdown.clone(),
    )));
    TestGateway {
        address,
        _shutdown: shutdown.drop_guard(),
        _handle: handle,
    }
}

pub(crate) struct SshClient;

impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) async fn connect(address: SocketAddr) -> Handle<SshClient> {
    client::connect(Default::default(), address, SshClient)
        .await
        .expect("Failed to connect to SSH server")
}

pub(crate) async fn authenticate(
    session: &mut Handle<SshClient>,
    user: &str,
    key: &PrivateKey,
) -> AuthResult {
    session
        .authenticate_publickey(
            user,
            PrivateKeyWithHashAlg::new(
                Arc::new(key.clone()),
                session.best_supported_rsa_hash().await.unwrap().flatten(),
            ),
        )
        .await
        .expect("SSH authentication failed")
}

/// Open a session channel and request a terminal and a shell on it.
pub(crate) async fn open_shell(session: &Handle<SshClient>) -> russh::Channel<Msg> {
    let channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("request_pty failed");
    channel
        .request_shell(false)
        .await
        .expect("request_shell failed");
    channel
}

pub(crate) async fn next_target(opened: &mut mpsc::UnboundedReceiver<OpenedTarget>) -> OpenedTarget {
    timeout(Duration::from_secs(5), opened.recv())
        .await
        .expect("Timeout waiting for the target to be opened")
        .expect("Connector went away")
}

/// Wait until the gateway has dropped the connection.
pub(crate) async fn wait_for_disconnect(session: &Handle<SshClient>) {
    timeout(Duration::from_secs(5), async {
        while !session.is_closed() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Timeout waiting for the gateway to disconnect");
}

/// Everything received on a client channel until it was closed.
#[derive(Debug, Default)]
pub(crate) struct ChannelOutcome {
    pub(crate) data: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) exit_status: Option<u32>,
}

pub(crate) async fn read_until_closed(channel: &mut russh::Channel<Msg>) -> ChannelOutcome {
    timeout(Duration::from_secs(5), async {
        let mut outcome = ChannelOutcome::default();
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { data } => outcome.data.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => outcome.stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => outcome.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => (),
            }
        }
        outcome
    })
    .await
    .expect("Timeout waiting for the channel to close")
}

/// Read client channel data until `expected` has been received.
pub(crate) async fn read_data(channel: &mut russh::Channel<Msg>, expected: &[u8]) {
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), async {
        while received.len() < expected.len() {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => received.extend_from_slice(&data),
                Some(_) => (),
                None => break,
            }
        }
    })
    .await
    .expect("Timeout waiting for channel data");
    assert_eq!(received, expected);
}

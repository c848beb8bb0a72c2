use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use color_eyre::eyre::Context;
use russh::{
    ChannelId, Disconnect,
    client::{self, Handle},
    keys::{PrivateKey, PublicKey, key::PrivateKeyWithHashAlg},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ConnectError, TargetConnector, TargetGuard, TargetRequest, TargetSession};
use crate::fingerprints::KeyFingerprint;

/// Where and as whom to reach a target over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshTarget {
    /// `host:port` of the target's SSH server.
    pub address: String,
    /// Remote user to authenticate as.
    pub user: String,
    /// Expected host key fingerprint. Any host key is accepted when missing.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

/// Opens a nested SSH connection to each target, authenticating with the gateway's own key.
pub struct SshConnector {
    targets: HashMap<String, SshTarget>,
    key: Arc<PrivateKey>,
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(targets: HashMap<String, SshTarget>, key: PrivateKey) -> Self {
        SshConnector {
            targets,
            key: Arc::new(key),
            config: Arc::new(client::Config::default()),
        }
    }

    /// Read the target table from a JSON file of the form
    /// `{"build-node": {"address": "10.0.0.5:22", "user": "deploy"}}`.
    pub async fn from_file(path: &Path, key: PrivateKey) -> color_eyre::Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Error reading targets file {}", path.display()))?;
        let targets: HashMap<String, SshTarget> =
            serde_json::from_str(&data).with_context(|| "Error parsing targets file")?;
        info!(count = targets.len(), "Loaded SSH targets.");
        Ok(Self::new(targets, key))
    }
}

struct TargetClient {
    expected_fingerprint: Option<String>,
    exit_status: Arc<Mutex<Option<u32>>>,
}

impl client::Handler for TargetClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let Some(expected) = self.expected_fingerprint.as_deref() else {
            return Ok(true);
        };
        let fingerprint = KeyFingerprint::from(key);
        if fingerprint.as_str() == expected {
            Ok(true)
        } else {
            warn!(%fingerprint, expected, "Target presented an unexpected host key.");
            Ok(false)
        }
    }

    async fn exit_status(
        &mut self,
        _channel: ChannelId,
        exit_status: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        *self.exit_status.lock().expect("not poisoned") = Some(exit_status);
        Ok(())
    }
}

// Keeps the nested connection alive until the session is released.
struct SshGuard {
    handle: Handle<TargetClient>,
    exit_status: Arc<Mutex<Option<u32>>>,
}

#[async_trait]
impl TargetGuard for SshGuard {
    async fn release(self: Box<Self>) -> Option<u32> {
        if let Err(error) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(%error, "Target connection already closed.");
        }
        *self.exit_status.lock().expect("not poisoned")
    }
}

async fn disconnect(handle: &Handle<TargetClient>) {
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
}

#[async_trait]
impl TargetConnector for SshConnector {
    async fn connect(&self, request: &TargetRequest) -> Result<TargetSession, ConnectError> {
        let target = self
            .targets
            .get(&request.target)
            .ok_or_else(|| ConnectError::UnknownTarget(request.target.clone()))?;
        let exit_status = Arc::new(Mutex::new(None));
        let client = TargetClient {
            expected_fingerprint: target.host_key_fingerprint.clone(),
            exit_status: Arc::clone(&exit_status),
        };
        let mut handle = client::connect(Arc::clone(&self.config), target.address.as_str(), client)
            .await
            .map_err(|error| ConnectError::Unreachable(format!("{}: {error}", target.address)))?;
        let hash_alg = match handle.best_supported_rsa_hash().await {
            Ok(hash_alg) => hash_alg.flatten(),
            Err(error) => {
                disconnect(&handle).await;
                return Err(ConnectError::Unreachable(error.to_string()));
            }
        };
        let authenticated = handle
            .authenticate_publickey(
                &target.user,
                PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg),
            )
            .await
            .map(|result| result.success());
        match authenticated {
            Ok(true) => (),
            Ok(false) => {
                disconnect(&handle).await;
                return Err(ConnectError::Rejected(format!(
                    "authentication as {} failed",
                    target.user
                )));
            }
            Err(error) => {
                disconnect(&handle).await;
                return Err(ConnectError::Unreachable(error.to_string()));
            }
        }
        let channel = match open_interactive_channel(&handle, request).await {
            Ok(channel) => channel,
            Err(error) => {
                disconnect(&handle).await;
                return Err(ConnectError::Rejected(error.to_string()));
            }
        };
        info!(target = %request.target, address = %target.address, "Opened SSH session to target.");
        Ok(TargetSession::from_stream(
            channel.into_stream(),
            Some(Box::new(SshGuard {
                handle,
                exit_status,
            })),
        ))
    }
}

async fn open_interactive_channel(
    handle: &Handle<TargetClient>,
    request: &TargetRequest,
) -> Result<russh::Channel<client::Msg>, russh::Error> {
    let channel = handle.channel_open_session().await?;
    if let Some(terminal) = request.terminal.as_ref() {
        channel
            .request_pty(
                false,
                &terminal.term,
                terminal.size.cols.into(),
                terminal.size.rows.into(),
                0,
                0,
                &[],
            )
            .await?;
    }
    match request.command.as_deref() {
        Some(command) => channel.exec(true, command).await?,
        None => channel.request_shell(true).await?,
    }
    Ok(channel)
}

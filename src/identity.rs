use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::eyre::Context;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use russh::keys::PublicKey;
use tokio::fs::{read_dir, read_to_string};

use crate::{error::ServerError, fingerprints::KeyFingerprint};

/// An authenticated principal, as known by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Opaque, stable identifier. Access grants are keyed by it.
    pub id: String,
    /// Human-readable name.
    pub label: String,
}

/// Maps a presented key to the identity that owns it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Return the active identity owning this key, or `None` for unknown and inactive keys.
    async fn resolve(&self, fingerprint: &KeyFingerprint) -> color_eyre::Result<Option<Identity>>;

    /// Note that `identity` just authenticated with `fingerprint`.
    async fn record_usage(
        &self,
        identity: &Identity,
        fingerprint: &KeyFingerprint,
    ) -> color_eyre::Result<()>;
}

// Extension for identity files whose keys must not authenticate.
const DISABLED_EXTENSION: &str = "disabled";

// Data related to a given key.
#[derive(Debug, Clone)]
struct KeyEntry {
    identity: Identity,
    active: bool,
}

/// Identity store backed by a directory of public key files, one file per identity.
///
/// The file stem names the identity, every non-comment line holds an OpenSSH public key,
/// and a `.disabled` extension deactivates all of the file's keys. The directory is read
/// again on every lookup, so edits and revocations apply to the next attempt.
pub struct DirectoryIdentityResolver {
    directory: PathBuf,
    last_used: DashMap<String, DateTime<Utc>>,
}

fn identity_for_file(path: &Path) -> Option<(Identity, bool)> {
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    let active = path.extension() != Some(OsStr::new(DISABLED_EXTENSION));
    Some((
        Identity {
            id: stem.clone(),
            label: stem,
        },
        active,
    ))
}

async fn load_identities(directory: &Path) -> color_eyre::Result<BTreeMap<KeyFingerprint, KeyEntry>> {
    let mut keys_map: BTreeMap<KeyFingerprint, KeyEntry> = BTreeMap::new();
    let mut read_dir = read_dir(directory)
        .await
        .with_context(|| format!("Error reading identities directory {}", directory.display()))?;
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .with_context(|| "Error listing identities directory")?
    {
        let path = entry.path();
        let Some((identity, active)) = identity_for_file(&path) else {
            continue;
        };
        let data = match read_to_string(&path).await {
            Ok(data) => data,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(?path, %error, "Unable to load identity file.");
                continue;
            }
        };
        for line in data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
        {
            match PublicKey::from_openssh(line) {
                Ok(key) => {
                    let fingerprint = KeyFingerprint::from(&key);
                    if let Some(previous) = keys_map.get(&fingerprint) {
                        #[cfg(not(coverage_nightly))]
                        tracing::warn!(
                            %fingerprint, first = %previous.identity.id, second = %identity.id,
                            "Key belongs to more than one identity; keeping the first.",
                        );
                        continue;
                    }
                    keys_map.insert(
                        fingerprint,
                        KeyEntry {
                            identity: identity.clone(),
                            active,
                        },
                    );
                }
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(?path, %error, "Unable to parse key.");
                }
            }
        }
    }
    #[cfg(not(coverage_nightly))]
    tracing::debug!(?directory, count = keys_map.len(), "Loaded identity keys.");
    Ok(keys_map)
}

impl DirectoryIdentityResolver {
    /// Serve identities from `directory`, which must already exist.
    pub async fn open(directory: PathBuf) -> color_eyre::Result<Self> {
        if !directory.as_path().is_dir() {
            return Err(ServerError::MissingDirectory(directory).into());
        }
        let count = load_identities(&directory).await?.len();
        #[cfg(not(coverage_nightly))]
        tracing::info!(?directory, count, "Serving identities.");
        Ok(DirectoryIdentityResolver {
            directory,
            last_used: DashMap::new(),
        })
    }

    /// When `identity` last authenticated through this process, if ever.
    pub fn last_used(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        self.last_used.get(&identity.id).map(|entry| *entry)
    }
}

#[async_trait]
impl IdentityResolver for DirectoryIdentityResolver {
    async fn resolve(&self, fingerprint: &KeyFingerprint) -> color_eyre::Result<Option<Identity>> {
        let mut keys = load_identities(&self.directory).await?;
        Ok(keys
            .remove(fingerprint)
            .filter(|entry| entry.active)
            .map(|entry| entry.identity))
    }

    async fn record_usage(
        &self,
        identity: &Identity,
        _fingerprint: &KeyFingerprint,
    ) -> color_eyre::Result<()> {
        self.last_used.insert(identity.id.clone(), Utc::now());
        Ok(())
    }
}

use std::path::Path;

use color_eyre::eyre::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    PrivateKey, decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use tokio::fs;
use tracing::info;

use crate::error::ServerError;

/// Load the gateway's host key from `path`, or generate and persist a new one if missing.
///
/// A file that exists but can't be read or decoded is an error: the gateway must not
/// start with an identity that clients have never seen.
pub async fn load_or_create(path: &Path, create_directory: bool) -> color_eyre::Result<PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!(?path, "Key file not found. Creating...");
            let key = PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            if create_directory {
                fs::create_dir_all(
                    path.parent()
                        .ok_or(ServerError::InvalidFilePath)
                        .with_context(|| "Error parsing secret key path")?,
                )
                .await
                .with_context(|| "Error creating secret key directory")?;
            }
            let key_string = key.to_openssh(LineEnding::LF)?;
            fs::write(path, key_string.as_bytes())
                .await
                .with_context(|| "Error saving secret key to filesystem")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .await
                    .with_context(|| "Error restricting secret key permissions")?;
            }
            decode_secret_key(&key_string, None).with_context(|| "Error decoding secret key")
        }
        Err(error) => Err(error).with_context(|| "Error reading secret key"),
    }
}

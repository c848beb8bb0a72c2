use std::fmt::Display;

use russh::keys::{HashAlg, PublicKey};

/// Lookup key for a public key: `SHA256:` followed by the lowercase hex digest of the key blob.
///
/// Always derived from the key presented on the current attempt; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&PublicKey> for KeyFingerprint {
    fn from(key: &PublicKey) -> Self {
        // The SHA256 fingerprint is computed over the wire encoding of the key,
        // i.e. the base64-decoded middle field of an OpenSSH key line.
        let digest = key.fingerprint(HashAlg::Sha256);
        KeyFingerprint(format!("SHA256:{}", hex::encode(digest.as_bytes())))
    }
}

impl Display for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

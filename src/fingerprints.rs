use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Context};
use log::info;
use russh::keys::{ssh_key::Fingerprint, HashAlg, PublicKey};
use tokio::fs;

// The set of public keys allowed to open tunnels, looked up by SHA-256
// fingerprint during the SSH handshake. Built once at startup.
#[derive(Debug)]
pub(crate) struct FingerprintsValidator {
    fingerprints: BTreeMap<Fingerprint, PublicKey>,
}

impl FingerprintsValidator {
    pub(crate) async fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .await
            .with_context(|| format!("Error reading authorized keys from {}", path.display()))?;
        let validator = Self::from_authorized_keys(&data)?;
        info!("Loaded {} authorized key(s).", validator.fingerprints.len());
        Ok(validator)
    }

    // Newline-separated OpenSSH public keys; blank lines and # comments
    // are skipped. Zero keys means nobody could ever connect, so it is an
    // error rather than an empty set.
    pub(crate) fn from_authorized_keys(data: &str) -> anyhow::Result<Self> {
        let mut fingerprints = BTreeMap::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = PublicKey::from_openssh(line)
                .with_context(|| format!("Error parsing authorized key {line:?}"))?;
            fingerprints.insert(key.fingerprint(HashAlg::Sha256), key);
        }
        if fingerprints.is_empty() {
            bail!("No authorized keys found");
        }
        Ok(FingerprintsValidator { fingerprints })
    }

    pub(crate) fn is_authorized(&self, key: &PublicKey) -> bool {
        self.fingerprints
            .contains_key(&key.fingerprint(HashAlg::Sha256))
    }
}

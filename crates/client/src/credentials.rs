//! File-backed key storage.
//!
//! Keys live in a directory as PKCS#8 PEM files. `adbkey` is tried first,
//! then every `*.pem` file in name order. A generated key is written to
//! `adbkey` together with `adbkey.pub`, which holds the public key in the
//! same text form that is offered to the device.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use protocol::{AdbPrivateKey, CredentialStore, ProtocolError, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::config::Config;

/// File name of the default key.
pub const DEFAULT_KEY_FILE: &str = "adbkey";

/// Reads a PKCS#8 PEM key.
pub fn read_pem_key(path: &Path) -> Result<AdbPrivateKey> {
    let pem = fs::read_to_string(path)?;
    let key = RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| ProtocolError::InvalidKey(format!("{}: {e}", path.display())))?;
    AdbPrivateKey::from_rsa(&key)
}

/// Writes a key as PKCS#8 PEM, readable by the owner only.
pub fn write_pem_key(path: &Path, key: &RsaPrivateKey) -> Result<()> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;

    let temp_path = path.with_extension("tmp");
    // A leftover temp file may have been created with wider permissions.
    match fs::remove_file(&temp_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&temp_path)?;
    file.write_all(pem.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Keys stored as PEM files in a directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
    key_name: String,
}

impl FileCredentialStore {
    /// Store rooted at `dir`. Keys are offered under `key_name`.
    pub fn new(dir: impl Into<PathBuf>, key_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key_name: key_name.into(),
        }
    }

    /// Store using the configured key directory and name.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.client.key_dir, &config.client.key_name)
    }

    /// Key directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key files in the order they are tried.
    pub fn key_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut pems: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "pem") && path.is_file())
            .collect();
        pems.sort();

        let mut paths = Vec::with_capacity(pems.len() + 1);
        let default = self.dir.join(DEFAULT_KEY_FILE);
        if default.is_file() {
            paths.push(default);
        }
        paths.extend(pems);
        Ok(paths)
    }

    /// Generates a key and writes `adbkey` and `adbkey.pub`.
    ///
    /// An existing `adbkey` is overwritten.
    pub fn generate_and_save(&self) -> Result<AdbPrivateKey> {
        fs::create_dir_all(&self.dir)?;

        let rsa_key = RsaPrivateKey::new(&mut OsRng, protocol::crypto::RSA_KEY_BITS)?;
        let key = AdbPrivateKey::from_rsa(&rsa_key)?.with_name(self.key_name.clone());

        let key_path = self.dir.join(DEFAULT_KEY_FILE);
        write_pem_key(&key_path, &rsa_key)?;

        let mut public = key.public_key().to_auth_payload(&self.key_name);
        public.pop();
        public.push(b'\n');
        fs::write(key_path.with_extension("pub"), public)?;

        tracing::info!(
            path = %key_path.display(),
            fingerprint = %key.public_key().fingerprint(),
            "Generated new key"
        );
        Ok(key)
    }
}

impl CredentialStore for FileCredentialStore {
    fn keys(&self) -> Result<Vec<AdbPrivateKey>> {
        let mut keys = Vec::new();
        for path in self.key_paths()? {
            match read_pem_key(&path) {
                Ok(key) => keys.push(key.with_name(self.key_name.clone())),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable key"),
            }
        }
        tracing::debug!(dir = %self.dir.display(), count = keys.len(), "Loaded keys");
        Ok(keys)
    }

    fn generate_key(&self) -> Result<AdbPrivateKey> {
        self.generate_and_save()
    }
}

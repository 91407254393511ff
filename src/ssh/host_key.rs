// Gitkit SSH Server - Host Key Management
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use russh_keys::{encode_pkcs8_pem, key, load_secret_key};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::auth::authorized_key_line;

/// Manages the server host key pair on disk
pub struct HostKeyStore {
    key_dir: PathBuf,
    host_key_path: PathBuf,
}

impl HostKeyStore {
    /// Create a store for `<key_dir>/<file_name>` and its `.pub` companion
    pub fn new<P: AsRef<Path>>(key_dir: P, file_name: &str) -> Self {
        let key_dir = key_dir.as_ref().to_path_buf();
        let host_key_path = key_dir.join(file_name);

        Self {
            key_dir,
            host_key_path,
        }
    }

    pub fn private_key_path(&self) -> &Path {
        &self.host_key_path
    }

    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.host_key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Load the host key, generating and persisting one first if absent
    pub fn load_or_generate(&self) -> Result<key::KeyPair> {
        if !self.host_key_path.exists() {
            info!("Generating new SSH host key: {:?}", self.host_key_path);
            self.generate_host_key()
                .with_context(|| "Failed to generate SSH host key")?;
        } else {
            info!("Using existing SSH host key: {:?}", self.host_key_path);
        }

        let key_pair = self.load_host_key()?;
        let fingerprint = key_pair.clone_public_key()?.fingerprint();
        info!("SSH server host key fingerprint: {}", fingerprint);
        Ok(key_pair)
    }

    fn generate_host_key(&self) -> Result<()> {
        if !self.key_dir.exists() {
            info!("Creating SSH key directory: {:?}", self.key_dir);
            fs::create_dir_all(&self.key_dir).with_context(|| {
                format!("Failed to create SSH key directory: {:?}", self.key_dir)
            })?;
        }

        let key_pair = key::KeyPair::generate_ed25519()
            .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key pair"))?;

        let mut pem_data = Vec::new();
        encode_pkcs8_pem(&key_pair, &mut pem_data)
            .with_context(|| "Failed to encode private key to PEM format")?;

        fs::write(&self.host_key_path, &pem_data)
            .with_context(|| format!("Failed to write private key to {:?}", self.host_key_path))?;
        set_mode(&self.host_key_path, 0o600)?;

        let public_key = key_pair.clone_public_key()?;
        let public_path = self.public_key_path();
        fs::write(&public_path, format!("{}\n", authorized_key_line(&public_key)))
            .with_context(|| format!("Failed to write public key to {:?}", public_path))?;
        set_mode(&public_path, 0o644)?;

        Ok(())
    }

    fn load_host_key(&self) -> Result<key::KeyPair> {
        load_secret_key(&self.host_key_path, None).with_context(|| {
            format!("Failed to load SSH host key from {:?}", self.host_key_path)
        })
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

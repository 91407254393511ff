// Gitkit SSH Server - Public Key Lookup
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Public key authorization.
//!
//! The server never decides on its own who may connect. Every presented key
//! is serialized in authorized-keys form (`ssh-ed25519 AAAA...`) and handed
//! to a [`PublicKeyLookup`]; the returned [`KeyRecord::id`] becomes the
//! `GITKIT_KEY` seen by git and its hooks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// A key known to the lookup backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub content: String,
}

/// Maps a presented public key to the principal it belongs to
#[async_trait]
pub trait PublicKeyLookup: Send + Sync {
    /// `Ok(None)` means the key is unknown and authentication must fail
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>>;
}

#[async_trait]
impl<F> PublicKeyLookup for F
where
    F: Fn(&str) -> Result<Option<KeyRecord>> + Send + Sync,
{
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>> {
        self(key)
    }
}

/// Serialize a key the way it appears in an authorized_keys file
pub fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

/// Lookup backed by an OpenSSH authorized_keys file.
///
/// The comment field of each line is used as the key id; lines without a
/// comment fall back to the key fingerprint.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    records: Vec<KeyRecord>,
}

impl AuthorizedKeys {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read authorized keys file {:?}", path))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let records = raw
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let record = parse_line(line);
                if record.is_none() && !is_blank_or_comment(line) {
                    warn!("Skipping malformed authorized key on line {}", index + 1);
                }
                record
            })
            .collect::<Vec<_>>();

        debug!("Loaded {} authorized keys", records.len());
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PublicKeyLookup for AuthorizedKeys {
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>> {
        let key = key.trim();
        Ok(self.records.iter().find(|record| record.content == key).cloned())
    }
}

fn is_blank_or_comment(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with('#')
}

fn is_key_algorithm(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

fn parse_line(line: &str) -> Option<KeyRecord> {
    if is_blank_or_comment(line) {
        return None;
    }

    let mut tokens = line.split_whitespace().peekable();
    // Leading options such as `no-pty,command="..."` are ignored
    while let Some(token) = tokens.peek() {
        if is_key_algorithm(token) {
            break;
        }
        tokens.next();
    }

    let algorithm = tokens.next()?;
    let encoded = tokens.next()?;
    let public_key = russh_keys::parse_public_key_base64(encoded).ok()?;
    let fingerprint = public_key.fingerprint();
    let comment = tokens.collect::<Vec<_>>().join(" ");

    let id = if comment.is_empty() { fingerprint.clone() } else { comment.clone() };

    Some(KeyRecord {
        id,
        name: comment,
        fingerprint,
        content: format!("{algorithm} {encoded}"),
    })
}

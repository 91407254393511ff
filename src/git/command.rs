// Gitkit SSH Server - Git Command Parsing
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parsing of SSH `exec` payloads into git transport commands.
//!
//! Clients send payloads such as:
//!
//! ```text
//! git-upload-pack 'org/repo.git'
//! git receive-pack '/org/repo.git'
//! ```
//!
//! Some clients wrap the command in parentheses or prefix it with NUL or
//! other control bytes; [`clean_payload`] strips those before matching.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use crate::error::{Error, Result};

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^git[-\s](upload-pack|receive-pack|upload-archive)\s+(?:'([^']*)'|"([^"]*)"|(\S+))\s*$"#,
    )
    .expect("git command regex is valid")
});

static SLASHES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/{2,}").expect("slash regex is valid"));

/// The git transport commands served over SSH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommandKind {
    UploadPack,
    ReceivePack,
    UploadArchive,
}

impl GitCommandKind {
    /// Sub-command passed to the git binary
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
            Self::UploadArchive => "upload-archive",
        }
    }

    /// Whether the command writes to the repository
    pub fn is_write(self) -> bool {
        matches!(self, Self::ReceivePack)
    }

    fn from_subcommand(name: &str) -> Option<Self> {
        match name {
            "upload-pack" => Some(Self::UploadPack),
            "receive-pack" => Some(Self::ReceivePack),
            "upload-archive" => Some(Self::UploadArchive),
            _ => None,
        }
    }
}

impl fmt::Display for GitCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.subcommand())
    }
}

/// A parsed `exec` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub kind: GitCommandKind,
    /// Repository path relative to the repository root
    pub repo: String,
}

impl GitCommand {
    /// Parse a raw exec payload, cleaning it first
    pub fn parse(payload: &str) -> Result<Self> {
        let cleaned = clean_payload(payload);
        let captures = COMMAND_RE
            .captures(&cleaned)
            .ok_or_else(|| Error::InvalidCommand(cleaned.clone()))?;

        let kind = captures
            .get(1)
            .and_then(|m| GitCommandKind::from_subcommand(m.as_str()))
            .ok_or_else(|| Error::InvalidCommand(cleaned.clone()))?;

        let raw_repo = captures
            .get(2)
            .or_else(|| captures.get(3))
            .or_else(|| captures.get(4))
            .map(|m| m.as_str())
            .unwrap_or_default();

        let repo = clean_repo_path(raw_repo);
        if repo.is_empty() {
            return Err(Error::InvalidCommand(format!("missing repository in {cleaned:?}")));
        }

        Ok(Self { kind, repo })
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.repo)
    }
}

/// Strip NUL bytes, control bytes and shell-style wrapping, then cut the
/// payload at the first `git` token.
pub fn clean_payload(payload: &str) -> String {
    let without_nul: String = payload.chars().filter(|c| *c != '\0').collect();
    let trimmed = without_nul
        .trim_matches(|c: char| c.is_control() || c.is_whitespace() || c == '(' || c == ')');

    match trimmed.find("git") {
        Some(start) => trimmed[start..].to_string(),
        None => trimmed.to_string(),
    }
}

fn clean_repo_path(raw: &str) -> String {
    let deduped = SLASHES_RE.replace_all(raw.trim(), "/");
    deduped.trim_start_matches('/').trim_end_matches('/').to_string()
}

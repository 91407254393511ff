// Gitkit SSH Server - Configuration
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Server defaults
pub const DEFAULT_GIT_PATH: &str = "git";
pub const DEFAULT_REPO_DIR: &str = "./repos";
pub const DEFAULT_KEY_DIR: &str = "./cache/ssh";
pub const HOST_KEY_FILE: &str = "gitkit.key";

/// Environment variable carrying the authenticated key id into git
pub const KEY_ID_ENV: &str = "GITKIT_KEY";

/// Scripts written into `hooks/` of managed repositories
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookScripts {
    pub pre_receive: Option<String>,
    pub update: Option<String>,
    pub post_receive: Option<String>,
}

impl HookScripts {
    /// Hook file names paired with their script bodies, skipping empty ones
    pub fn scripts(&self) -> Vec<(&'static str, &str)> {
        [
            ("pre-receive", self.pre_receive.as_deref()),
            ("update", self.update.as_deref()),
            ("post-receive", self.post_receive.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, body)| match body {
            Some(body) if !body.trim().is_empty() => Some((name, body)),
            _ => None,
        })
        .collect()
    }
}

/// Git SSH server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that contains repositories
    pub dir: PathBuf,
    /// Directory for the server host key
    pub key_dir: PathBuf,
    /// Path to the git binary
    pub git_path: String,
    /// Required SSH user name (only checked when `auth` is enabled)
    pub git_user: Option<String>,
    /// Create missing repositories on first access
    pub auto_create: bool,
    /// Install hook scripts into repositories
    pub auto_hooks: bool,
    pub hooks: HookScripts,
    /// Drop the connection on any push attempt
    pub read_only: bool,
    /// Require public key authentication
    pub auth: bool,
    /// Authorized keys file backing the default key lookup
    pub authorized_keys: Option<PathBuf>,
    /// Close every connection after this many seconds
    pub timeout_secs: Option<u64>,
    /// Close the connection after the first channel finishes
    pub disable_conn_reuse: bool,
    /// Allow at most one connection per remote host
    pub disable_simultaneous_conns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_REPO_DIR),
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            git_path: DEFAULT_GIT_PATH.to_string(),
            git_user: None,
            auto_create: false,
            auto_hooks: false,
            hooks: HookScripts::default(),
            read_only: false,
            auth: false,
            authorized_keys: None,
            timeout_secs: None,
            disable_conn_reuse: false,
            disable_simultaneous_conns: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config.normalized())
    }

    /// Fill in defaults for values left empty
    pub fn normalized(mut self) -> Self {
        if self.git_path.trim().is_empty() {
            self.git_path = DEFAULT_GIT_PATH.to_string();
        }
        if self.git_user.as_deref().is_some_and(str::is_empty) {
            self.git_user = None;
        }
        self
    }

    /// Path of the server's private host key
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(HOST_KEY_FILE)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}

#[derive(Parser)]
#[command(author, version, about = "A git SSH server")]
pub struct Cli {
    /// Listen address
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, default_value_t = 2222)]
    pub port: u16,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Repository root directory
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Host key directory
    #[arg(long)]
    pub key_dir: Option<PathBuf>,

    /// Path to the git binary
    #[arg(long)]
    pub git_path: Option<String>,

    /// Only accept this SSH user name
    #[arg(long)]
    pub git_user: Option<String>,

    /// Create repositories on first access
    #[arg(long)]
    pub auto_create: bool,

    /// Install configured hooks into repositories
    #[arg(long)]
    pub auto_hooks: bool,

    /// Reject pushes by dropping the connection
    #[arg(long)]
    pub read_only: bool,

    /// Require public key authentication
    #[arg(long)]
    pub auth: bool,

    /// Authorized keys file used for authentication
    #[arg(long)]
    pub authorized_keys: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Close the connection after one command
    #[arg(long)]
    pub disable_conn_reuse: bool,

    /// Reject simultaneous connections from the same host
    #[arg(long)]
    pub disable_simultaneous_conns: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Enable trace output (extremely verbose)
    #[arg(short, long)]
    pub trace: bool,
}

impl Cli {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        if self.trace {
            "gitkit_ssh=trace,russh=debug,info"
        } else if self.debug {
            "gitkit_ssh=debug,info"
        } else {
            "info"
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Merge command line flags over the (optional) config file
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(dir) = &self.dir {
            config.dir = dir.clone();
        }
        if let Some(key_dir) = &self.key_dir {
            config.key_dir = key_dir.clone();
        }
        if let Some(git_path) = &self.git_path {
            config.git_path = git_path.clone();
        }
        if let Some(git_user) = &self.git_user {
            config.git_user = Some(git_user.clone());
        }
        if let Some(authorized_keys) = &self.authorized_keys {
            config.authorized_keys = Some(authorized_keys.clone());
        }
        if self.timeout.is_some() {
            config.timeout_secs = self.timeout;
        }
        config.auto_create |= self.auto_create;
        config.auto_hooks |= self.auto_hooks;
        config.read_only |= self.read_only;
        config.auth |= self.auth;
        config.disable_conn_reuse |= self.disable_conn_reuse;
        config.disable_simultaneous_conns |= self.disable_simultaneous_conns;

        Ok(config.normalized())
    }
}

// Gitkit SSH Server - Repository Store
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Repository layout under the configured root.
//!
//! The SSH layer only needs to know whether a repository exists and how to
//! create one; [`RepositoryStore`] is that seam. [`FsRepositoryStore`] keeps
//! bare repositories on the local filesystem and shells out to `git init`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::hooks::install_hooks;
use crate::config::{Config, HookScripts};

/// Storage backend for served repositories
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Prepare the store before the server starts listening
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Map a client supplied repository path to a location under the root
    fn resolve(&self, repo: &str) -> Result<PathBuf>;

    fn exists(&self, repo: &str) -> bool;

    async fn init(&self, repo: &str) -> Result<()>;
}

/// Bare repositories stored under a local directory
#[derive(Debug, Clone)]
pub struct FsRepositoryStore {
    root: PathBuf,
    git_path: String,
    hooks: Option<HookScripts>,
}

impl FsRepositoryStore {
    pub fn new<P: AsRef<Path>>(root: P, git_path: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            git_path: git_path.into(),
            hooks: None,
        }
    }

    /// Build the store described by the server configuration
    pub fn from_config(config: &Config) -> Self {
        let store = Self::new(&config.dir, config.git_path.clone());
        if config.auto_hooks {
            store.with_hooks(config.hooks.clone())
        } else {
            store
        }
    }

    /// Install these hooks on setup and on every newly created repository
    pub fn with_hooks(mut self, hooks: HookScripts) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RepositoryStore for FsRepositoryStore {
    async fn setup(&self) -> Result<()> {
        if !self.root.exists() {
            info!("Creating repository directory: {:?}", self.root);
            fs::create_dir_all(&self.root)
                .with_context(|| format!("Failed to create repository directory {:?}", self.root))?;
        }

        let Some(hooks) = &self.hooks else {
            return Ok(());
        };

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read repository directory {:?}", self.root))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                install_hooks(&path, hooks)?;
            }
        }

        Ok(())
    }

    fn resolve(&self, repo: &str) -> Result<PathBuf> {
        let relative = Path::new(repo);
        if relative.as_os_str().is_empty() {
            bail!("repository path is empty");
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("repository path {:?} escapes the repository root", repo),
            }
        }

        Ok(self.root.join(relative))
    }

    fn exists(&self, repo: &str) -> bool {
        self.resolve(repo)
            .map(|path| path.join("objects").is_dir())
            .unwrap_or(false)
    }

    async fn init(&self, repo: &str) -> Result<()> {
        let path = self.resolve(repo)?;
        info!("Initializing repository {:?}", path);

        let output = Command::new(&self.git_path)
            .arg("init")
            .arg("--bare")
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {} init", self.git_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("git init failed for {:?}: {}", path, stderr.trim());
            bail!("git init --bare {:?} exited with {}: {}", path, output.status, stderr.trim());
        }

        if let Some(hooks) = &self.hooks {
            install_hooks(&path, hooks)?;
        }

        debug!("Repository {:?} ready", path);
        Ok(())
    }
}

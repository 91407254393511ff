//! # Gitkit SSH Server Library
//!
//! An SSH server that exposes git repositories the way a hosted forge does:
//! - `git-upload-pack`, `git-receive-pack` and `git-upload-archive` over SSH
//! - Pluggable public key authorization with the key id exported to git as `GITKIT_KEY`
//! - Automatic repository creation and hook installation
//! - Read-only mode, per-connection timeouts, connection reuse and
//!   simultaneous connection limits
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! gitkit-ssh = { git = "https://github.com/Akaere-NetWorks/gitkit-ssh.git" }
//! tokio = { version = "1.35", features = ["full"] }
//! anyhow = "1.0"
//! ```
//!
//! Basic usage:
//! ```no_run
//! use gitkit_ssh::{Config, GitSshServer, KeyRecord};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config {
//!         dir: "/srv/git".into(),
//!         auto_create: true,
//!         auth: true,
//!         ..Config::default()
//!     };
//!
//!     let server = GitSshServer::new(config).with_public_key_lookup(|key: &str| -> anyhow::Result<_> {
//!         Ok(Some(KeyRecord {
//!             id: key.to_string(),
//!             ..KeyRecord::default()
//!         }))
//!     });
//!
//!     server.listen(":2222").await?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod git;
pub mod ssh;

// Re-export commonly used types for convenience
pub use auth::{AuthorizedKeys, KeyRecord, PublicKeyLookup};
pub use config::{Config, HookScripts};
pub use error::{Error, Result};
pub use git::{FsRepositoryStore, GitCommand, GitCommandKind, RepositoryStore};
pub use ssh::{ConnectionRegistry, GitSshServer};

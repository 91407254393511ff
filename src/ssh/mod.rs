// Gitkit SSH Server - SSH Module
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SSH server module serving git repositories over the SSH protocol
//!
//! Each accepted TCP connection is checked against the connection gate, then
//! handed to its own [`GitSshHandler`]. Every session channel runs exactly one
//! git command:
//! - `git-upload-pack` (fetch/clone)
//! - `git-receive-pack` (push)
//! - `git-upload-archive` (archive --remote)

pub mod executor;
pub mod gate;
pub mod handler;
pub mod host_key;
pub mod server;

pub use gate::{ConnectionRegistry, HostLease};
pub use handler::GitSshHandler;
pub use host_key::HostKeyStore;
pub use server::GitSshServer;

// Gitkit SSH Server - Git Module
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git side of the server: exec payload parsing and repository storage.

pub mod command;
pub mod hooks;
pub mod repository;

pub use command::{GitCommand, GitCommandKind, clean_payload};
pub use repository::{FsRepositoryStore, RepositoryStore};

// Gitkit SSH Server - Error Types
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the git SSH server

use thiserror::Error;

/// Server error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("server has already been started")]
    AlreadyStarted,

    #[error("cannot call serve() before listen()")]
    NoListener,

    #[error("server listener has been closed")]
    ServerClosed,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("server setup failed: {0}")]
    Setup(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("command execution failed: {0}")]
    Execution(String),

    #[error("connection rejected: {0}")]
    PolicyRejection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Keys(#[from] russh_keys::Error),
}

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an `anyhow` error chain raised during `listen()`
    pub fn setup(err: anyhow::Error) -> Self {
        Self::Setup(format!("{err:#}"))
    }

    /// Policy rejections are deliberate closes, not faults
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::PolicyRejection(_))
    }
}

// Gitkit SSH Server - Git Command Execution
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runs one git transport command per SSH channel.
//!
//! The child's stdout is forwarded as channel data and its stderr as
//! extended data (type 1). Client data arrives through an unbounded queue
//! fed by the session handler and is written to the child's stdin by a
//! separate task, so a slow stdin never stalls the outbound copy.

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, KEY_ID_ENV};
use crate::error::{Error, Result};
use crate::git::GitCommand;

/// SSH extended data type for stderr (RFC 4254 section 5.2)
pub const STDERR_EXTENDED_DATA: u32 = 1;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Build the git invocation for `command`.
///
/// Session `env` variables are applied before `GITKIT_KEY` so a client can
/// never override its own identity.
pub fn git_command(config: &Config, command: &GitCommand, key_id: &str, env: &[(String, String)]) -> Command {
    let mut cmd = Command::new(&config.git_path);
    cmd.arg(command.kind.subcommand())
        .arg(&command.repo)
        .current_dir(&config.dir)
        .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .env(KEY_ID_ENV, key_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

pub fn spawn(config: &Config, command: &GitCommand, key_id: &str, env: &[(String, String)]) -> Result<Child> {
    let child = git_command(config, command, key_id, env).spawn()?;
    debug!(
        pid = ?child.id(),
        command = %command,
        "spawned {} {}",
        config.git_path,
        command.kind.subcommand()
    );
    Ok(child)
}

/// Pump the child's streams through the channel and wait for it to exit.
///
/// The child is killed when `cancel` fires or when the channel stops
/// accepting data.
pub async fn run_to_completion(
    mut child: Child,
    stdin_rx: UnboundedReceiver<Vec<u8>>,
    handle: Handle,
    channel: ChannelId,
    cancel: CancellationToken,
) -> Result<ExitStatus> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Execution("cant open stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Execution("cant open stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Execution("cant open stderr pipe".into()))?;

    let stdin_task = tokio::spawn(copy_inbound(stdin_rx, stdin));

    let outbound = async {
        tokio::try_join!(
            copy_outbound(stdout, &handle, channel, None),
            copy_outbound(stderr, &handle, channel, Some(STDERR_EXTENDED_DATA)),
        )
    };

    let copied = tokio::select! {
        result = outbound => result.map(|_| ()),
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "channel closed")),
    };

    if let Err(e) = &copied {
        debug!(?channel, error = %e, "stopping git process");
        let _ = child.start_kill();
    }

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status?,
        None => {
            let _ = child.start_kill();
            child.wait().await?
        }
    };

    stdin_task.abort();

    match copied {
        Ok(()) => Ok(status),
        Err(e) => Err(Error::Execution(format!("stream copy failed: {e}"))),
    }
}

async fn copy_inbound(mut rx: UnboundedReceiver<Vec<u8>>, mut stdin: ChildStdin) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!(error = %e, "failed to write to git stdin (process may have exited)");
            return;
        }
    }
    // Client sent EOF
    let _ = stdin.shutdown().await;
}

async fn copy_outbound<R>(mut reader: R, handle: &Handle, channel: ChannelId, extended: Option<u32>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "SSH channel closed"));
        }
    }
}

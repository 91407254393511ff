// Gitkit SSH Server - SSH Session Handler
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, MethodSet, Sig};
use russh_keys::key;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor;
use super::gate::HostLease;
use crate::auth::{PublicKeyLookup, authorized_key_line};
use crate::config::Config;
use crate::error::Error;
use crate::git::{GitCommand, RepositoryStore};

/// Shared, read-only state handed to every connection
pub struct SessionContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn RepositoryStore>,
    pub lookup: Option<Arc<dyn PublicKeyLookup>>,
}

/// Channel requests the server knows how to answer
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelRequest {
    Env { name: String, value: String },
    Exec(Vec<u8>),
    Unsupported(&'static str),
}

/// Per-channel state
struct ChannelState {
    /// Variables from `env` requests, passed to the spawned git process
    env: Vec<(String, String)>,
    /// Queue feeding the running command's stdin
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exec_started: bool,
    cancel: CancellationToken,
}

impl ChannelState {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            env: Vec::new(),
            stdin: None,
            exec_started: false,
            cancel,
        }
    }
}

/// Closes a channel and applies the connection policies
#[derive(Clone)]
struct ChannelTeardown {
    handle: Handle,
    peer_addr: SocketAddr,
    disable_conn_reuse: bool,
    lease: Option<Arc<HostLease>>,
}

impl ChannelTeardown {
    async fn finish(self, channel: ChannelId) {
        let _ = self.handle.eof(channel).await;
        let _ = self.handle.close(channel).await;

        if self.disable_conn_reuse {
            debug!("ssh: disposing connection from {}", self.peer_addr);
            if let Err(e) = self
                .handle
                .disconnect(Disconnect::ByApplication, "connection reuse is disabled".into(), String::new())
                .await
            {
                debug!("ssh: error while closing {}: {:?}", self.peer_addr, e);
            }
        }

        if let Some(lease) = self.lease {
            lease.release();
        }
    }
}

/// Git SSH connection handler
pub struct GitSshHandler {
    ctx: Arc<SessionContext>,
    peer_addr: SocketAddr,
    lease: Option<Arc<HostLease>>,
    username: Option<String>,
    /// Id of the authenticated key, empty without authentication
    key_id: String,
    channels: HashMap<ChannelId, ChannelState>,
    /// Cancelled when the connection goes away
    closed: CancellationToken,
}

impl GitSshHandler {
    pub fn new(ctx: Arc<SessionContext>, peer_addr: SocketAddr, lease: Option<Arc<HostLease>>) -> Self {
        Self {
            ctx,
            peer_addr,
            lease,
            username: None,
            key_id: String::new(),
            channels: HashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn teardown(&self, session: &Session) -> ChannelTeardown {
        ChannelTeardown {
            handle: session.handle(),
            peer_addr: self.peer_addr,
            disable_conn_reuse: self.ctx.config.disable_conn_reuse,
            lease: self.lease.clone(),
        }
    }

    /// End a channel from inside a handler callback
    fn finish_channel(&mut self, channel: ChannelId, session: &mut Session) {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin.take();
        }
        tokio::spawn(self.teardown(session).finish(channel));
    }

    async fn dispatch(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<(), Error> {
        match request {
            ChannelRequest::Env { name, value } => {
                self.set_env(channel, &name, &value);
                Ok(())
            }
            ChannelRequest::Exec(payload) => self.exec(channel, &payload, session).await,
            ChannelRequest::Unsupported(kind) => {
                session.channel_failure(channel);
                self.end_unsupported(channel, kind, session);
                Ok(())
            }
        }
    }

    /// Tell the client a request is unsupported and end the channel.
    ///
    /// Channels with a running command only log the request.
    fn end_unsupported(&mut self, channel: ChannelId, kind: &'static str, session: &mut Session) {
        let running = self
            .channels
            .get(&channel)
            .is_some_and(|state| state.exec_started);
        if running {
            debug!(peer = %self.peer_addr, "ssh: ignoring {} on busy channel {:?}", kind, channel);
            return;
        }

        warn!(peer = %self.peer_addr, "ssh: unsupported req type: {}", kind);
        session.data(channel, CryptoVec::from_slice(b"Unsupported request type.\r\n"));
        self.finish_channel(channel, session);
    }

    fn set_env(&mut self, channel: ChannelId, name: &str, value: &str) {
        let name = name.replace('\0', "");
        let name = name.trim_start_matches('\x04');
        let value = value.replace('\0', "");

        if name.is_empty() || name.contains('=') {
            warn!(peer = %self.peer_addr, "env: invalid key from payload: {:?}", name);
            return;
        }

        debug!(peer = %self.peer_addr, "ssh: incoming env request: {}={}", name, value);
        match self.channels.get_mut(&channel) {
            Some(state) => state.env.push((name.to_string(), value)),
            None => warn!(peer = %self.peer_addr, "env: unknown channel {:?}", channel),
        }
    }

    async fn exec(&mut self, channel: ChannelId, payload: &[u8], session: &mut Session) -> Result<(), Error> {
        let raw = String::from_utf8_lossy(payload).into_owned();
        info!(
            peer = %self.peer_addr,
            user = ?self.username,
            key_id = %self.key_id,
            "ssh: incoming exec request: {}",
            raw.escape_debug()
        );

        let env = match self.channels.get_mut(&channel) {
            Some(state) if !state.exec_started => {
                state.exec_started = true;
                state.env.clone()
            }
            Some(_) => {
                warn!(peer = %self.peer_addr, "ssh: channel {:?} already ran a command", channel);
                session.channel_failure(channel);
                return Ok(());
            }
            None => {
                warn!(peer = %self.peer_addr, "ssh: exec on unknown channel {:?}", channel);
                session.channel_failure(channel);
                return Ok(());
            }
        };

        let store = Arc::clone(&self.ctx.store);
        let parsed = GitCommand::parse(&raw).and_then(|command| {
            store
                .resolve(&command.repo)
                .map_err(|e| Error::InvalidCommand(format!("{e:#}")))?;
            Ok(command)
        });
        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                warn!(peer = %self.peer_addr, "ssh: error parsing command: {}", e);
                session.data(channel, CryptoVec::from_slice(b"Invalid command.\r\n"));
                session.channel_failure(channel);
                self.finish_channel(channel, session);
                return Ok(());
            }
        };

        if self.ctx.config.auto_create && !store.exists(&command.repo) {
            if let Err(e) = store.init(&command.repo).await {
                error!(repo = %command.repo, "repo-init: {:#}", e);
                session.channel_failure(channel);
                self.finish_channel(channel, session);
                return Ok(());
            }
        }

        // Pushes to a read-only server look like a dropped connection to the
        // client; git reports the push failing with an EOF.
        if command.kind.is_write() && self.ctx.config.read_only {
            warn!(peer = %self.peer_addr, repo = %command.repo, "ssh: rejecting push to read-only server");
            return Err(Error::PolicyRejection(format!(
                "{} is not allowed on a read-only server",
                command.kind
            )));
        }

        let child = match executor::spawn(&self.ctx.config, &command, &self.key_id, &env) {
            Ok(child) => child,
            Err(e) => {
                error!(repo = %command.repo, "ssh: start error: {}", e);
                session.channel_failure(channel);
                self.finish_channel(channel, session);
                return Ok(());
            }
        };

        session.channel_success(channel);

        // Unbounded: `data` runs on the connection's event loop and must not
        // wait on git, so a slow reader buffers the push in memory.
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let cancel = match self.channels.get_mut(&channel) {
            Some(state) => {
                state.stdin = Some(stdin_tx);
                state.cancel.clone()
            }
            None => self.closed.child_token(),
        };

        let handle = session.handle();
        let teardown = self.teardown(session);
        let peer_addr = self.peer_addr;
        tokio::spawn(async move {
            match executor::run_to_completion(child, stdin_rx, handle.clone(), channel, cancel).await {
                Ok(status) if status.success() => {
                    debug!(peer = %peer_addr, repo = %command.repo, "ssh: {} finished", command.kind);
                    let _ = handle.exit_status_request(channel, 0).await;
                }
                Ok(status) => {
                    warn!(peer = %peer_addr, repo = %command.repo, "ssh: command failed: {}", status);
                }
                Err(e) => {
                    warn!(peer = %peer_addr, repo = %command.repo, "ssh: command failed: {}", e);
                }
            }
            teardown.finish(channel).await;
        });

        Ok(())
    }
}

impl Drop for GitSshHandler {
    fn drop(&mut self) {
        // Kills any git process still attached to this connection
        self.closed.cancel();
    }
}

#[async_trait]
impl server::Handler for GitSshHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.ctx.config.auth {
            debug!(peer = %self.peer_addr, "ssh: rejecting none auth for {}", user);
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PUBLICKEY),
            });
        }

        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &key::PublicKey) -> Result<Auth, Self::Error> {
        if !self.ctx.config.auth {
            self.username = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        if let Some(required) = &self.ctx.config.git_user {
            if user != required {
                warn!(peer = %self.peer_addr, "ssh: user {:?} does not match {:?}", user, required);
                return Err(Error::PolicyRejection(format!("user {user:?} is not allowed")));
            }
        }

        let Some(lookup) = self.ctx.lookup.clone() else {
            error!("ssh: public key lookup is not configured");
            return Ok(Self::reject());
        };

        let key = authorized_key_line(public_key);
        match lookup.lookup(&key).await {
            Ok(Some(record)) => {
                info!(
                    peer = %self.peer_addr,
                    user = %user,
                    key_id = %record.id,
                    fingerprint = %public_key.fingerprint(),
                    "SSH public key authentication successful"
                );
                self.username = Some(user.to_string());
                self.key_id = record.id;
                Ok(Auth::Accept)
            }
            Ok(None) => {
                warn!(peer = %self.peer_addr, fingerprint = %public_key.fingerprint(), "ssh: auth handler did not return a key");
                Ok(Self::reject())
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, fingerprint = %public_key.fingerprint(), "ssh: key lookup failed: {:#}", e);
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer_addr, "SSH channel opened: {:?}", channel.id());
        self.channels
            .insert(channel.id(), ChannelState::new(self.closed.child_token()));
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.dispatch(channel, request, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Exec(data.to_vec()), session)
            .await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Unsupported("shell"), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Unsupported("subsystem"), session)
            .await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Unsupported("pty-req"), session)
            .await
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Unsupported("x11-req"), session)
            .await
    }

    async fn agent_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<bool, Self::Error> {
        // russh sends the failure reply for us when this returns false
        self.end_unsupported(channel, "auth-agent-req@openssh.com", session);
        Ok(false)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Unsupported("window-change"), session)
            .await
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, session: &mut Session) -> Result<(), Self::Error> {
        debug!(peer = %self.peer_addr, "ssh: signal {:?} on channel {:?}", signal, channel);
        self.dispatch(channel, ChannelRequest::Unsupported("signal"), session)
            .await
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.channels.get(&channel).and_then(|state| state.stdin.as_ref()) {
            if stdin.send(data.to_vec()).is_err() {
                debug!(peer = %self.peer_addr, "ssh: stdin of channel {:?} already closed", channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer_addr, "SSH channel EOF: {:?}", channel);
        // Dropping the sender lets the stdin task close the pipe once drained
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin.take();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer_addr, "SSH channel closed: {:?}", channel);
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }
}

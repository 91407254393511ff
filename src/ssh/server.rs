// Gitkit SSH Server - SSH Server Implementation
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use russh::server;
use russh::{Disconnect, MethodSet, SshId};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::gate::{ConnectionRegistry, HostLease};
use super::handler::{GitSshHandler, SessionContext};
use super::host_key::HostKeyStore;
use crate::auth::PublicKeyLookup;
use crate::config::{Config, HOST_KEY_FILE};
use crate::error::{Error, Result};
use crate::git::{FsRepositoryStore, RepositoryStore};

/// Identification string sent before key exchange
pub fn server_version() -> String {
    format!("SSH-2.0-gitkit {}", env!("CARGO_PKG_VERSION"))
}

/// State that exists between `listen()` and `stop()`
#[derive(Clone)]
struct Listening {
    listener: Arc<TcpListener>,
    ssh_config: Arc<server::Config>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

/// SSH server for git repositories
pub struct GitSshServer {
    config: Arc<Config>,
    lookup: Option<Arc<dyn PublicKeyLookup>>,
    store: Arc<dyn RepositoryStore>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<Option<Listening>>,
}

impl GitSshServer {
    /// Create a server storing repositories under `config.dir`
    pub fn new(config: Config) -> Self {
        let config = config.normalized();
        let store = Arc::new(FsRepositoryStore::from_config(&config));

        Self {
            config: Arc::new(config),
            lookup: None,
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            state: Mutex::new(None),
        }
    }

    /// Resolve presented public keys through `lookup`
    pub fn with_public_key_lookup<L>(mut self, lookup: L) -> Self
    where
        L: PublicKeyLookup + 'static,
    {
        self.lookup = Some(Arc::new(lookup));
        self
    }

    pub fn with_repository_store<S>(mut self, store: S) -> Self
    where
        S: RepositoryStore + 'static,
    {
        self.store = Arc::new(store);
        self
    }

    /// Share a connection registry between servers
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn listening(&self) -> Option<Listening> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build the russh configuration, generating the host key if needed
    fn ssh_config(&self) -> Result<server::Config> {
        if self.config.key_dir.as_os_str().is_empty() {
            return Err(Error::Setup("key directory is not provided".into()));
        }

        if self.config.auth && self.lookup.is_none() {
            return Err(Error::Setup("public key lookup is not provided".into()));
        }

        let host_key = HostKeyStore::new(&self.config.key_dir, HOST_KEY_FILE)
            .load_or_generate()
            .map_err(Error::setup)?;

        let methods = if self.config.auth {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::NONE | MethodSet::PUBLICKEY
        };

        Ok(server::Config {
            server_id: SshId::Standard(server_version()),
            methods,
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        })
    }

    /// Prepare the host key and repository root, then bind `bind`.
    ///
    /// `":0"` binds an ephemeral port on all interfaces; see [`Self::address`].
    pub async fn listen(&self, bind: &str) -> Result<()> {
        if self.listening().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let ssh_config = self.ssh_config()?;
        self.store.setup().await.map_err(Error::setup)?;

        let bind_addr = normalize_bind(bind);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::Setup(format!("failed to bind SSH server to {bind_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_some() {
            return Err(Error::AlreadyStarted);
        }
        *state = Some(Listening {
            listener: Arc::new(listener),
            ssh_config: Arc::new(ssh_config),
            shutdown: CancellationToken::new(),
            local_addr,
        });

        info!("SSH server listening on {}", local_addr);
        Ok(())
    }

    /// Accept connections until [`Self::stop`] is called.
    ///
    /// Always ends with an error; [`Error::ServerClosed`] is the normal
    /// shutdown signal.
    pub async fn serve(&self) -> Result<()> {
        let Listening {
            listener,
            ssh_config,
            shutdown,
            ..
        } = self.listening().ok_or(Error::NoListener)?;

        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            lookup: self.lookup.clone(),
        });

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SSH server stopped accepting connections");
                    return Err(Error::ServerClosed);
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.accept(stream, peer_addr, &ssh_config, &ctx),
                Err(e) => {
                    error!("Failed to accept SSH connection: {}", e);
                }
            }
        }
    }

    pub async fn listen_and_serve(&self, bind: &str) -> Result<()> {
        self.listen(bind).await?;
        self.serve().await
    }

    /// Close the listener; open sessions are left to finish on their own
    pub fn stop(&self) {
        let listening = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(listening) = listening {
            info!("Stopping SSH server on {}", listening.local_addr);
            listening.shutdown.cancel();
        }
    }

    /// Bound local address, useful after binding to port 0
    pub fn address(&self) -> Option<SocketAddr> {
        self.listening().map(|listening| listening.local_addr)
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        ssh_config: &Arc<server::Config>,
        ctx: &Arc<SessionContext>,
    ) {
        let lease = if self.config.disable_simultaneous_conns {
            match HostLease::acquire(&self.registry, peer_addr.ip()) {
                Some(lease) => Some(Arc::new(lease)),
                None => {
                    warn!(
                        "can't have multiple simultaneous connections from the same client: {}",
                        peer_addr
                    );
                    drop(stream);
                    return;
                }
            }
        } else {
            None
        };

        info!("SSH connection from {}", peer_addr);

        let deadline = self.config.timeout().map(|timeout| Instant::now() + timeout);
        let handler = GitSshHandler::new(Arc::clone(ctx), peer_addr, lease.clone());
        let config = Arc::clone(ssh_config);

        tokio::spawn(async move {
            match run_session(stream, peer_addr, config, handler, deadline).await {
                Ok(()) => debug!("SSH session completed for {}", peer_addr),
                Err(e) if e.is_policy_rejection() => {
                    info!("ssh: closed connection from {}: {}", peer_addr, e)
                }
                Err(e) => warn!("SSH connection error from {}: {}", peer_addr, e),
            }

            if let Some(lease) = lease {
                lease.release();
            }
        });
    }
}

/// Drive one connection, enforcing the optional watchdog deadline
async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<server::Config>,
    handler: GitSshHandler,
    deadline: Option<Instant>,
) -> Result<()> {
    debug!("ssh: handshaking for {}", peer_addr);

    let session = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, server::run_stream(config, stream, handler))
            .await
            .map_err(|_| Error::Handshake("timed out before the session started".into()))??,
        None => server::run_stream(config, stream, handler).await?,
    };

    let watchdog = deadline.map(|deadline| {
        let handle = session.handle();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("ssh: connection from {} timed out", peer_addr);
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "connection timed out".into(), String::new())
                .await
            {
                debug!("ssh: error while closing {}: {:?}", peer_addr, e);
            }
        })
    });

    let result = session.await;
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    result
}

/// Accept Go-style `":port"` addresses
fn normalize_bind(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    }
}

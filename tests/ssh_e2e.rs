// Gitkit SSH Server - End-to-end SSH Tests
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

#![cfg(unix)]

use async_trait::async_trait;
use gitkit_ssh::{Config, Error, FsRepositoryStore, GitSshServer, KeyRecord, RepositoryStore};
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Everything a channel produced before it closed
#[derive(Debug, Default)]
struct ChannelOutput {
    success: bool,
    failure: bool,
    success_before_data: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

struct TestServer {
    server: Arc<GitSshServer>,
    addr: SocketAddr,
    serving: JoinHandle<gitkit_ssh::Result<()>>,
    presented_keys: Arc<Mutex<Vec<String>>>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    async fn start(configure: impl FnOnce(&mut Config)) -> Self {
        Self::start_with(configure, |server, _| server).await
    }

    async fn start_with(
        configure: impl FnOnce(&mut Config),
        customize: impl FnOnce(GitSshServer, &Config) -> GitSshServer,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let repos = tmp.path().join("repos");
        std::fs::create_dir_all(&repos).unwrap();

        // git is replaced by `sh <subcommand> <repo>`, which runs the script
        // named after the subcommand from the repository root.
        write_script(&repos, "upload-pack", "printf 'upload-pack %s key=%s proto=%s' \"$1\" \"$GITKIT_KEY\" \"$GIT_PROTOCOL\"\nprintf 'counting objects' >&2\n");
        write_script(&repos, "upload-archive", "cat\n");
        write_script(&repos, "receive-pack", "touch receive-pack-ran\nexit 3\n");

        let mut config = Config {
            dir: repos,
            key_dir: tmp.path().join("keys"),
            git_path: "/bin/sh".into(),
            auth: true,
            ..Config::default()
        };
        configure(&mut config);

        let presented_keys = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&presented_keys);
        let lookup = move |key: &str| -> anyhow::Result<Option<KeyRecord>> {
            recorded.lock().unwrap().push(key.to_string());
            Ok(Some(KeyRecord {
                id: "alice".into(),
                ..KeyRecord::default()
            }))
        };

        let server = GitSshServer::new(config.clone()).with_public_key_lookup(lookup);
        let server = Arc::new(customize(server, &config));
        server.listen("127.0.0.1:0").await.unwrap();
        let addr = server.address().unwrap();

        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve().await }
        });

        Self {
            server,
            addr,
            serving,
            presented_keys,
            _tmp: tmp,
        }
    }

    fn repo_root(&self) -> &Path {
        self.server.config().dir.as_path()
    }

    async fn connect(&self) -> client::Handle<TestClient> {
        let (session, authenticated) = self.connect_as("git").await;
        assert!(authenticated);
        session
    }

    async fn connect_as(&self, user: &str) -> (client::Handle<TestClient>, bool) {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, self.addr, TestClient).await.unwrap();
        let key_pair = key::KeyPair::generate_ed25519().unwrap();
        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await;
        (session, matches!(authenticated, Ok(true)))
    }

    async fn shutdown(self) {
        self.server.stop();
        let result = tokio::time::timeout(WAIT, self.serving).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ServerClosed)));
    }
}

/// Creates repositories without git and remembers which ones
struct RecordingStore {
    inner: FsRepositoryStore,
    created: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RepositoryStore for RecordingStore {
    async fn setup(&self) -> anyhow::Result<()> {
        self.inner.setup().await
    }

    fn resolve(&self, repo: &str) -> anyhow::Result<PathBuf> {
        self.inner.resolve(repo)
    }

    fn exists(&self, repo: &str) -> bool {
        self.inner.exists(repo)
    }

    async fn init(&self, repo: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.inner.resolve(repo)?.join("objects"))?;
        self.created.lock().unwrap().push(repo.to_string());
        Ok(())
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

async fn collect(channel: &mut russh::Channel<client::Msg>) -> ChannelOutput {
    let mut output = ChannelOutput::default();
    let drain = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Success => {
                    output.success = true;
                    output.success_before_data = output.stdout.is_empty() && output.stderr.is_empty();
                }
                ChannelMsg::Failure => output.failure = true,
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => output.stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }
    };
    tokio::time::timeout(WAIT, drain).await.unwrap();
    output
}

#[tokio::test]
async fn upload_pack_streams_output_and_exit_status() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.set_env(false, "GIT_PROTOCOL", "version=2").await.unwrap();
    channel.exec(true, "git-upload-pack 'repo.git'").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(output.success);
    assert!(output.success_before_data);
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "upload-pack repo.git key=alice proto=version=2"
    );
    assert_eq!(String::from_utf8_lossy(&output.stderr), "counting objects");
    assert_eq!(output.exit_status, Some(0));

    let presented = server.presented_keys.lock().unwrap().clone();
    assert!(!presented.is_empty());
    assert!(presented.iter().all(|key| key.starts_with("ssh-ed25519 ")));

    server.shutdown().await;
}

#[tokio::test]
async fn client_input_reaches_git_stdin() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git upload-archive '/repo.git'").await.unwrap();
    channel.data(&b"want HEAD\n"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let output = collect(&mut channel).await;
    assert!(output.success);
    assert_eq!(output.stdout, b"want HEAD\n");
    assert_eq!(output.exit_status, Some(0));

    server.shutdown().await;
}

#[tokio::test]
async fn failed_command_sends_no_exit_status() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-receive-pack 'repo.git'").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(output.success);
    assert_eq!(output.exit_status, None);
    assert!(server.repo_root().join("receive-pack-ran").exists());

    server.shutdown().await;
}

#[tokio::test]
async fn invalid_command_is_rejected() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "rm -rf /").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(!output.success);
    assert!(output.failure);
    assert_eq!(output.stdout, b"Invalid command.\r\n");
    assert_eq!(output.exit_status, None);

    server.shutdown().await;
}

async fn assert_unsupported(channel: &mut russh::Channel<client::Msg>) {
    let output = collect(channel).await;
    assert!(!output.success);
    assert!(output.failure);
    assert_eq!(output.stdout, b"Unsupported request type.\r\n");
    assert_eq!(output.exit_status, None);
}

async fn assert_upload_pack_runs(session: &client::Handle<TestClient>) {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-upload-pack 'repo.git'").await.unwrap();
    let output = collect(&mut channel).await;
    assert_eq!(output.exit_status, Some(0));
}

#[tokio::test]
async fn unsupported_requests_end_only_their_channel() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut shell = session.channel_open_session().await.unwrap();
    shell.request_shell(true).await.unwrap();
    assert_unsupported(&mut shell).await;

    let mut pty = session.channel_open_session().await.unwrap();
    pty.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await.unwrap();
    assert_unsupported(&mut pty).await;

    let mut x11 = session.channel_open_session().await.unwrap();
    x11.request_x11(true, false, "MIT-MAGIC-COOKIE-1", "00", 0)
        .await
        .unwrap();
    assert_unsupported(&mut x11).await;

    assert_upload_pack_runs(&session).await;

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_env_is_skipped() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.set_env(false, "", "empty").await.unwrap();
    channel.set_env(false, "GIT_PROTOCOL=version", "1").await.unwrap();
    channel.set_env(false, "GIT_PROTOCOL", "version=2").await.unwrap();
    channel.exec(true, "git-upload-pack 'repo.git'").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(output.success);
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "upload-pack repo.git key=alice proto=version=2"
    );
    assert_eq!(output.exit_status, Some(0));

    server.shutdown().await;
}

#[tokio::test]
async fn only_session_channels_are_accepted() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let forwarded = session
        .channel_open_direct_tcpip("127.0.0.1", 22, "127.0.0.1", 40000)
        .await;
    assert!(forwarded.is_err());

    assert_upload_pack_runs(&session).await;

    server.shutdown().await;
}

#[tokio::test]
async fn large_input_is_streamed_through_git() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-upload-archive 'repo.git'").await.unwrap();
    channel.data(&payload[..]).await.unwrap();
    channel.eof().await.unwrap();

    let output = collect(&mut channel).await;
    assert_eq!(output.stdout.len(), payload.len());
    assert!(output.stdout == payload);
    assert_eq!(output.exit_status, Some(0));

    server.shutdown().await;
}

#[tokio::test]
async fn required_user_mismatch_closes_the_connection() {
    let server = TestServer::start(|config| config.git_user = Some("git".into())).await;

    let (session, authenticated) = server.connect_as("mallory").await;
    assert!(!authenticated);
    let opened = tokio::time::timeout(WAIT, session.channel_open_session()).await;
    assert!(!matches!(opened, Ok(Ok(_))));
    assert!(server.presented_keys.lock().unwrap().is_empty());

    let session = server.connect().await;
    assert_upload_pack_runs(&session).await;

    server.shutdown().await;
}

#[tokio::test]
async fn timeout_cuts_off_running_commands() {
    let server = TestServer::start(|config| config.timeout_secs = Some(1)).await;
    let session = server.connect().await;

    // cat never sees EOF, so only the watchdog can end this command
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-upload-archive 'repo.git'").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(output.success);
    assert_eq!(output.exit_status, None);

    let reopened = tokio::time::timeout(WAIT, session.channel_open_session()).await;
    assert!(!matches!(reopened, Ok(Ok(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn read_only_push_drops_the_connection() {
    let server = TestServer::start(|config| config.read_only = true).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-receive-pack 'repo.git'").await.unwrap();

    let output = collect(&mut channel).await;
    assert!(!output.success);
    assert!(output.stdout.is_empty());
    assert_eq!(output.exit_status, None);
    assert!(!server.repo_root().join("receive-pack-ran").exists());

    let reopened = tokio::time::timeout(WAIT, session.channel_open_session()).await;
    assert!(!matches!(reopened, Ok(Ok(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn disabled_reuse_closes_connection_after_one_command() {
    let server = TestServer::start(|config| config.disable_conn_reuse = true).await;
    let session = server.connect().await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "git-upload-pack 'repo.git'").await.unwrap();
    let output = collect(&mut channel).await;
    assert_eq!(output.exit_status, Some(0));

    let reopened = tokio::time::timeout(WAIT, session.channel_open_session()).await;
    assert!(!matches!(reopened, Ok(Ok(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn connection_is_reusable_by_default() {
    let server = TestServer::start(|_| {}).await;
    let session = server.connect().await;

    for _ in 0..2 {
        let mut channel = session.channel_open_session().await.unwrap();
        channel.exec(true, "git-upload-pack 'repo.git'").await.unwrap();
        let output = collect(&mut channel).await;
        assert_eq!(output.exit_status, Some(0));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn auto_create_initializes_missing_repository() {
    let created = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&created);
    let server = TestServer::start_with(
        |config| config.auto_create = true,
        move |server, config| {
            server.with_repository_store(RecordingStore {
                inner: FsRepositoryStore::from_config(config),
                created: recorded,
            })
        },
    )
    .await;

    let session = server.connect().await;
    for _ in 0..2 {
        let mut channel = session.channel_open_session().await.unwrap();
        channel.exec(true, "git-upload-pack 'fresh.git'").await.unwrap();
        let output = collect(&mut channel).await;
        assert_eq!(output.exit_status, Some(0));
    }

    assert_eq!(*created.lock().unwrap(), vec!["fresh.git".to_string()]);
    assert!(server.repo_root().join("fresh.git/objects").is_dir());

    server.shutdown().await;
}

#[tokio::test]
async fn simultaneous_connections_from_one_host_are_refused() {
    let server = TestServer::start(|config| config.disable_simultaneous_conns = true).await;

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    let banner = read_some(&mut first).await;
    assert!(banner.starts_with(b"SSH-2.0-gitkit"));

    let mut second = TcpStream::connect(server.addr).await.unwrap();
    assert!(read_some(&mut second).await.is_empty());

    drop(first);

    let mut admitted = false;
    for _ in 0..50 {
        let mut third = TcpStream::connect(server.addr).await.unwrap();
        if read_some(&mut third).await.starts_with(b"SSH-2.0-gitkit") {
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(admitted);

    server.shutdown().await;
}

#[tokio::test]
async fn timeout_closes_idle_connections() {
    let server = TestServer::start(|config| config.timeout_secs = Some(1)).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    assert!(read_some(&mut stream).await.starts_with(b"SSH-2.0-gitkit"));

    // Never send our identification; the watchdog must close the socket
    let mut buf = [0u8; 256];
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    server.shutdown().await;
}

/// Read whatever arrives first; empty on EOF or reset
async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    match tokio::time::timeout(WAIT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => buf[..n].to_vec(),
        Ok(Err(_)) => Vec::new(),
        Err(_) => panic!("no data and no close within {:?}", WAIT),
    }
}

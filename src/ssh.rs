//! SSH sessions.
//!
//! `SshSession::authenticate` turns an inventory `Host` into a ready session;
//! `close` consumes it. Commands run on their own channel with the same
//! drain-both-then-wait discipline as local execution, and files move over
//! SFTP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use futures::stream::{self, StreamExt};
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{ExecutionContext, Result, StormError, TransferStage};
use crate::inventory::Host;
use crate::remote::{write_file, Connector, RemoteDirs, RemoteFiles, RemoteSession};
use crate::sink::{OutputSink, Stream};
use crate::stream::drain;

/// In-memory pipe capacity between the channel pump and each drain.
const PIPE_CAPACITY: usize = 64 * 1024;

/// How server host keys are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any key. Unsafe on untrusted networks.
    #[default]
    AcceptAny,
    /// Only accept keys already listed in `~/.ssh/known_hosts`.
    KnownHosts,
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Duration,
    /// Deadline for each remote command. `None` waits forever.
    pub command_timeout: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout: Duration::from_secs(30),
            command_timeout: None,
        }
    }
}

struct HostKeyCheck {
    policy: HostKeyPolicy,
    address: String,
    port: u16,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts => {
                match russh_keys::check_known_hosts(&self.address, self.port, server_public_key) {
                    Ok(known) => Ok(known),
                    Err(e) => {
                        warn!(address = %self.address, "host key check failed: {}", e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Credentials picked for a host, before any network activity.
enum Credentials {
    Key(Arc<KeyPair>),
    Password(String),
}

impl Credentials {
    /// A parseable private key wins over a password.
    fn resolve(host: &Host) -> Result<Self> {
        let auth_error = |reason: String| StormError::Auth {
            host: host.name.clone(),
            reason,
        };
        let password = host.password.as_deref().filter(|p| !p.is_empty());
        let key = host.private_key.as_deref().filter(|k| !k.trim().is_empty());

        match (key, password) {
            (None, None) => Err(auth_error("ssh key or password is required".to_string())),
            (None, Some(password)) => Ok(Self::Password(password.to_string())),
            (Some(key), password) => match russh_keys::decode_secret_key(key, None) {
                Ok(pair) => Ok(Self::Key(Arc::new(pair))),
                Err(e) => match password {
                    Some(password) => {
                        warn!(host = %host.name, "unusable private key ({}), using password", e);
                        Ok(Self::Password(password.to_string()))
                    }
                    None => Err(auth_error(format!("failed to parse private key: {}", e))),
                },
            },
        }
    }
}

pub struct SshSession {
    host: Host,
    handle: Handle<HostKeyCheck>,
    command_timeout: Option<Duration>,
}

impl SshSession {
    /// Dials `host` and logs in as its user.
    ///
    /// Fails with `Auth` before dialing if the host has no usable credential.
    pub async fn authenticate(host: &Host, options: &SshOptions) -> Result<Self> {
        let credentials = Credentials::resolve(host)?;
        let connect_error = |reason: String| StormError::Connect {
            host: host.name.clone(),
            address: host.socket_address(),
            reason,
        };

        let config = Arc::new(client::Config::default());
        let handler = HostKeyCheck {
            policy: options.host_key_policy,
            address: host.address.clone(),
            port: host.port,
        };
        debug!(host = %host.name, address = %host.socket_address(), "dialing");
        let dial = client::connect(config, (host.address.as_str(), host.port), handler);
        let mut handle = match time::timeout(options.connect_timeout, dial).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(connect_error(e.to_string())),
            Err(_) => {
                return Err(connect_error(format!(
                    "timed out after {}s",
                    options.connect_timeout.as_secs()
                )))
            }
        };

        let accepted = match credentials {
            Credentials::Key(pair) => handle.authenticate_publickey(&host.user, pair).await,
            Credentials::Password(password) => {
                handle.authenticate_password(&host.user, password).await
            }
        };
        let auth_error = |reason: String| StormError::Auth {
            host: host.name.clone(),
            reason,
        };
        match accepted {
            Ok(true) => {}
            Ok(false) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(auth_error(format!("credential rejected for user '{}'", host.user)));
            }
            Err(e) => return Err(auth_error(e.to_string())),
        }

        debug!(host = %host.name, "authenticated");
        Ok(Self {
            host: host.clone(),
            handle,
            command_timeout: options.command_timeout,
        })
    }

    async fn open_sftp(&self, remote_path: &str) -> Result<SftpSession> {
        let stage_error =
            |e: String| StormError::transfer(&self.host.name, TransferStage::Channel, remote_path, e);
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| stage_error(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| stage_error(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| stage_error(e.to_string()))
    }

    async fn send<R: AsyncRead + Unpin + Send>(&self, source: &mut R, remote_path: &str) -> Result<()> {
        let sftp = self.open_sftp(remote_path).await?;
        let result = write_file(&SftpFiles(&sftp), &self.host.name, source, remote_path).await;
        if let Err(e) = sftp.close().await {
            debug!(host = %self.host.name, "error while closing SFTP session: {}", e);
        }
        let written = result?;
        debug!(host = %self.host.name, remote_path, bytes = written, "transferred");
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn execute(&self, command: &str, sink: &dyn OutputSink) -> Result<String> {
        let fail = |reason: String| {
            StormError::execution(
                ExecutionContext::Remote(self.host.name.clone()),
                command,
                reason,
            )
        };
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| fail(format!("failed to open session: {}", e)))?;

        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        // Both drains are polled before the pump starts the command, and the
        // pump drops its ends on return, which lets the drains finish.
        let drains = join(
            drain(stdout_rx, Stream::Stdout, sink),
            drain(stderr_rx, Stream::Stderr, sink),
        );
        let run = join(drains, pump(&mut channel, command, stdout_tx, stderr_tx));

        let ((stdout, stderr), exit) = match self.command_timeout {
            None => run.await,
            Some(limit) => {
                let outcome = time::timeout(limit, run).await;
                match outcome {
                    Ok(finished) => finished,
                    Err(_) => {
                        let _ = channel.close().await;
                        return Err(fail(format!("timed out after {}s", limit.as_secs_f64())));
                    }
                }
            }
        };

        let stdout = stdout.map_err(|e| fail(format!("error while streaming stdout: {}", e)))?;
        let stderr = stderr.map_err(|e| fail(format!("error while streaming stderr: {}", e)))?;
        let captured = stdout + &stderr;
        match exit.map_err(fail)? {
            Exit::Status(0) => Ok(captured),
            Exit::Status(code) => Err(StormError::exited(
                ExecutionContext::Remote(self.host.name.clone()),
                command,
                i32::try_from(code).unwrap_or(i32::MAX),
                &captured,
            )),
            Exit::Signal(signal) => Err(fail(format!("terminated by signal {}", signal))),
            Exit::Unknown => Err(fail("channel closed without an exit status".to_string())),
        }
    }

    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut source = tokio::fs::File::open(local_path).await.map_err(|e| {
            StormError::transfer(
                &self.host.name,
                TransferStage::OpenLocal,
                &local_path.display().to_string(),
                e,
            )
        })?;
        self.send(&mut source, remote_path).await
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<()> {
        let mut source = contents;
        self.send(&mut source, remote_path).await
    }

    async fn close(self: Box<Self>) {
        debug!(host = %self.host.name, "terminating connection");
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(host = %self.host.name, "error while terminating: {}", e);
        }
    }
}

#[derive(Debug, PartialEq)]
enum Exit {
    Status(u32),
    Signal(String),
    Unknown,
}

/// Starts `command` on `channel` and forwards its output into the drain pipes
/// until the channel closes.
async fn pump(
    channel: &mut Channel<Msg>,
    command: &str,
    stdout: DuplexStream,
    stderr: DuplexStream,
) -> std::result::Result<Exit, String> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| format!("failed to start command: {}", e))?;
    let messages = stream::unfold(channel, |channel| async move {
        channel.wait().await.map(|message| (message, channel))
    });
    forward(messages, stdout, stderr).await
}

/// Routes channel messages: data to `stdout`, extended data 1 to `stderr`.
/// Both pipes are dropped at EOF, or at the latest when this returns, which
/// ends the drains reading them.
async fn forward<S, W>(messages: S, stdout: W, stderr: W) -> std::result::Result<Exit, String>
where
    S: futures::Stream<Item = ChannelMsg>,
    W: AsyncWrite + Unpin,
{
    futures::pin_mut!(messages);
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut exit = Exit::Unknown;
    while let Some(message) = messages.next().await {
        match message {
            ChannelMsg::Data { ref data } => {
                if let Some(pipe) = stdout.as_mut() {
                    pipe.write_all(data)
                        .await
                        .map_err(|e| format!("error while streaming stdout: {}", e))?;
                }
            }
            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                if let Some(pipe) = stderr.as_mut() {
                    pipe.write_all(data)
                        .await
                        .map_err(|e| format!("error while streaming stderr: {}", e))?;
                }
            }
            ChannelMsg::Eof => {
                stdout = None;
                stderr = None;
            }
            ChannelMsg::ExitStatus { exit_status } => exit = Exit::Status(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                exit = Exit::Signal(format!("{:?}", signal_name))
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(exit)
}

struct SftpFiles<'a>(&'a SftpSession);

#[async_trait]
impl RemoteDirs for SftpFiles<'_> {
    async fn exists(&self, path: &str) -> std::result::Result<bool, String> {
        self.0.try_exists(path).await.map_err(|e| e.to_string())
    }

    async fn create_dir(&self, path: &str) -> std::result::Result<(), String> {
        self.0.create_dir(path).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RemoteFiles for SftpFiles<'_> {
    type File = File;

    async fn create(&self, path: &str) -> std::result::Result<File, String> {
        self.0.create(path).await.map_err(|e| e.to_string())
    }
}

/// Opens real SSH sessions.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession::authenticate(host, &self.options).await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use russh::{CryptoVec, Sig};

    use crate::sink::Capture;

    fn data(bytes: &[u8]) -> ChannelMsg {
        ChannelMsg::Data {
            data: CryptoVec::from_slice(bytes),
        }
    }

    fn extended(bytes: &[u8], ext: u32) -> ChannelMsg {
        ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(bytes),
            ext,
        }
    }

    /// Feeds `messages` through `forward` into two live drains.
    async fn route(messages: Vec<ChannelMsg>) -> (Capture, Exit) {
        let capture = Capture::new();
        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let ((stdout, stderr), exit) = join(
            join(
                drain(stdout_rx, Stream::Stdout, &capture),
                drain(stderr_rx, Stream::Stderr, &capture),
            ),
            forward(stream::iter(messages), stdout_tx, stderr_tx),
        )
        .await;
        stdout.unwrap();
        stderr.unwrap();
        (capture, exit.unwrap())
    }

    #[tokio::test]
    async fn test_forward_splits_streams() {
        let (capture, exit) = route(vec![
            data(b"hel"),
            data(b"lo\nwor"),
            extended(b"oops\n", 1),
            data(b"ld\n"),
            extended(b"not stderr\n", 2),
            ChannelMsg::ExitStatus { exit_status: 0 },
            ChannelMsg::Eof,
            ChannelMsg::Close,
        ])
        .await;
        assert_eq!(capture.stream(Stream::Stdout), vec!["hello", "world"]);
        assert_eq!(capture.stream(Stream::Stderr), vec!["oops"]);
        assert_eq!(exit, Exit::Status(0));
    }

    #[tokio::test]
    async fn test_forward_keeps_status_sent_after_eof() {
        let (capture, exit) = route(vec![
            data(b"before\n"),
            ChannelMsg::Eof,
            data(b"after\n"),
            ChannelMsg::ExitStatus { exit_status: 7 },
            ChannelMsg::Close,
        ])
        .await;
        assert_eq!(capture.stream(Stream::Stdout), vec!["before"]);
        assert_eq!(exit, Exit::Status(7));
    }

    #[tokio::test]
    async fn test_forward_reports_signal() {
        let (_, exit) = route(vec![
            ChannelMsg::ExitSignal {
                signal_name: Sig::TERM,
                core_dumped: false,
                error_message: String::new(),
                lang_tag: String::new(),
            },
            ChannelMsg::Close,
        ])
        .await;
        assert_eq!(exit, Exit::Signal("TERM".to_string()));
    }

    #[tokio::test]
    async fn test_forward_close_without_status() {
        // No Eof either: the drains still finish once the pipes are dropped.
        let (capture, exit) = route(vec![data(b"partial"), ChannelMsg::Close, data(b"late\n")]).await;
        assert_eq!(capture.stream(Stream::Stdout), vec!["partial"]);
        assert_eq!(exit, Exit::Unknown);

        let (capture, exit) = route(vec![]).await;
        assert!(capture.lines().is_empty());
        assert_eq!(exit, Exit::Unknown);
    }

    #[tokio::test]
    async fn test_no_credentials_fails_without_dialing() {
        // TEST-NET-3: dialing it would hang until the connect timeout.
        let host = Host::new("lonely", "203.0.113.7", "nobody");
        let options = SshOptions {
            connect_timeout: Duration::from_secs(20),
            ..SshOptions::default()
        };
        let started = Instant::now();
        let err = match SshSession::authenticate(&host, &options).await {
            Err(err) => err,
            Ok(_) => panic!("authenticated without credentials"),
        };
        assert!(matches!(err, StormError::Auth { .. }));
        assert!(err.to_string().contains("ssh key or password is required"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unparseable_key_without_password_is_auth_error() {
        let mut host = Host::new("a", "h", "u");
        host.private_key = Some("not a key".to_string());
        let err = match Credentials::resolve(&host) {
            Err(err) => err,
            Ok(_) => panic!("resolved garbage key"),
        };
        assert!(matches!(err, StormError::Auth { .. }));
        assert!(err.to_string().contains("failed to parse private key"));
    }

    #[test]
    fn test_unparseable_key_falls_back_to_password() {
        let mut host = Host::new("a", "h", "u");
        host.private_key = Some("not a key".to_string());
        host.password = Some("secret".to_string());
        assert!(matches!(
            Credentials::resolve(&host),
            Ok(Credentials::Password(password)) if password == "secret"
        ));
    }

    #[test]
    fn test_password_only() {
        let mut host = Host::new("a", "h", "u");
        host.password = Some("secret".to_string());
        assert!(matches!(
            Credentials::resolve(&host),
            Ok(Credentials::Password(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_dial_is_connect_error() {
        // Bind then drop a listener to get a local port that refuses connections.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut host = Host::new("closed", "127.0.0.1", "u");
        host.port = port;
        host.password = Some("secret".to_string());
        let err = match SshSession::authenticate(&host, &SshOptions::default()).await {
            Err(err) => err,
            Ok(_) => panic!("connected to a closed port"),
        };
        assert!(matches!(err, StormError::Connect { .. }));
        assert!(err.to_string().contains("[closed]"));
    }
}

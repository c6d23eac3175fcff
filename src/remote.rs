//! Remote session seams.
//!
//! The fleet orchestrator only talks to hosts through these traits. The SSH
//! implementation lives in `ssh`; tests plug in their own sessions.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StormError, TransferStage};
use crate::inventory::Host;
use crate::sink::OutputSink;

/// An authenticated connection to one host.
///
/// Sessions are owned by exactly one worker and must be closed by it.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &Host;

    /// Runs `command` remotely, streaming its output to `sink` line by line.
    /// Returns the captured output: stdout lines followed by stderr lines.
    async fn execute(&self, command: &str, sink: &dyn OutputSink) -> Result<String>;

    /// Copies a local file to `remote_path`, creating missing directories.
    async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Writes `contents` to `remote_path`, creating missing directories.
    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<()>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn RemoteSession>>;
}

/// Directory primitives of a remote filesystem.
#[async_trait]
pub trait RemoteDirs: Send + Sync {
    async fn exists(&self, path: &str) -> std::result::Result<bool, String>;
    async fn create_dir(&self, path: &str) -> std::result::Result<(), String>;
}

/// A remote filesystem that can also create files.
#[async_trait]
pub trait RemoteFiles: RemoteDirs {
    type File: AsyncWrite + Unpin + Send;

    /// Creates or truncates `path`.
    async fn create(&self, path: &str) -> std::result::Result<Self::File, String>;
}

/// Streams `source` into `remote_path` on `files`, creating missing parent
/// directories first. Returns the number of bytes written.
pub async fn write_file<F, R>(
    files: &F,
    host: &str,
    source: &mut R,
    remote_path: &str,
) -> Result<u64>
where
    F: RemoteFiles,
    R: AsyncRead + Unpin + Send + ?Sized,
{
    if let Some(parent) = parent_dir(remote_path) {
        ensure_dir_all(files, parent)
            .await
            .map_err(|(dir, reason)| StormError::transfer(host, TransferStage::CreateDir, &dir, reason))?;
    }
    let mut file = files
        .create(remote_path)
        .await
        .map_err(|e| StormError::transfer(host, TransferStage::OpenRemote, remote_path, e))?;
    let write_error = |e: std::io::Error| StormError::transfer(host, TransferStage::Write, remote_path, e);
    let written = tokio::io::copy(source, &mut file).await.map_err(write_error)?;
    file.shutdown().await.map_err(write_error)?;
    Ok(written)
}

/// Makes sure `dir` and all of its ancestors exist.
///
/// Walks up from `dir` until an existing ancestor is found, then creates each
/// missing level on the way back down. A failed create counts as success when
/// the directory exists afterwards, so racing creators never fail each other.
/// On error, returns the directory that could not be created and why.
pub async fn ensure_dir_all(
    dirs: &dyn RemoteDirs,
    dir: &str,
) -> std::result::Result<(), (String, String)> {
    let chain = directory_chain(dir);
    let mut missing_from = chain.len();
    while missing_from > 0 {
        let candidate = &chain[missing_from - 1];
        match dirs.exists(candidate).await {
            Ok(true) => break,
            Ok(false) => missing_from -= 1,
            Err(reason) => return Err((candidate.clone(), reason)),
        }
    }
    for missing in &chain[missing_from..] {
        if let Err(reason) = dirs.create_dir(missing).await {
            if !dirs.exists(missing).await.unwrap_or(false) {
                return Err((missing.clone(), reason));
            }
        }
    }
    Ok(())
}

/// Parent directory of a `/`-separated remote path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

/// Every directory from the shallowest ancestor down to `dir` itself.
fn directory_chain(dir: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = String::new();
    if dir.starts_with('/') {
        current.push('/');
    }
    for part in dir.split('/').filter(|part| !part.is_empty() && *part != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        chain.push(current.clone());
    }
    chain
}

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StormError>;

#[derive(Error, Debug)]
pub enum StormError {
    #[error("Failed to load {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("[{host}] Authentication failed: {reason}")]
    Auth { host: String, reason: String },
    #[error("[{host}] Failed to connect to {address}: {reason}")]
    Connect {
        host: String,
        address: String,
        reason: String,
    },
    #[error("Job '{job}' needs '{needs}', which did not complete successfully")]
    Dependency { job: String, needs: String },
    #[error("{context}Command '{command}' failed: {reason}")]
    Execution {
        context: ExecutionContext,
        command: String,
        /// Set when the command ran and exited non-zero.
        exit_code: Option<i32>,
        reason: String,
    },
    #[error("[{host}] Transfer failed while {stage} '{path}': {reason}")]
    Transfer {
        host: String,
        stage: TransferStage,
        path: String,
        reason: String,
    },
    #[error("[{host}] Platform not supported: {platform}")]
    UnsupportedPlatform { host: String, platform: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StormError {
    pub fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// The command could not be run to completion: spawn, transport or timeout failures.
    pub fn execution(context: ExecutionContext, command: &str, reason: impl ToString) -> Self {
        Self::Execution {
            context,
            command: command.to_string(),
            exit_code: None,
            reason: reason.to_string(),
        }
    }

    /// The command ran and exited with a non-zero `code`. Non-empty `output` is appended.
    pub fn exited(context: ExecutionContext, command: &str, code: i32, output: &str) -> Self {
        let mut reason = format!("exited with status {}", code);
        if !output.trim().is_empty() {
            reason.push_str(": ");
            reason.push_str(output.trim());
        }
        Self::Execution {
            context,
            command: command.to_string(),
            exit_code: Some(code),
            reason,
        }
    }

    /// Exit code of a command that ran and failed, as opposed to one that never finished.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn transfer(host: &str, stage: TransferStage, path: &str, reason: impl ToString) -> Self {
        Self::Transfer {
            host: host.to_string(),
            stage,
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Where a failed command was running. Rendered as a message prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    Local,
    Remote(String),
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Local => Ok(()),
            ExecutionContext::Remote(host) => write!(f, "[{}] ", host),
        }
    }
}

/// The stage of a file transfer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Channel,
    CreateDir,
    OpenLocal,
    OpenRemote,
    Write,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            TransferStage::Channel => "opening the SFTP channel for",
            TransferStage::CreateDir => "creating remote directory",
            TransferStage::OpenLocal => "opening local file",
            TransferStage::OpenRemote => "creating remote file",
            TransferStage::Write => "writing remote file",
        };
        f.write_str(stage)
    }
}

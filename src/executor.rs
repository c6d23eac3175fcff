//! Local command execution.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::future::join;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time;
use tracing::debug;

use crate::error::{ExecutionContext, Result, StormError};
use crate::sink::{OutputSink, Stream};
use crate::stream::drain;

const SHELL: &str = "sh";

/// Runs one shell command line at a time and streams its output.
///
/// The command line always goes to a real shell (`sh -c`), so chains, pipes,
/// quoting and globs behave exactly as written. The child is started inside
/// the requested working directory; the current process never changes its
/// own working directory.
///
/// On Unix the shell leads its own process group. A command that times out,
/// or whose future is dropped, takes the whole group down with it, including
/// pipeline stages and background jobs.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the command if it is still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        working_directory: &Path,
        command_line: &str,
        sink: &dyn OutputSink,
    ) -> Result<()> {
        if command_line.trim().is_empty() {
            return Ok(());
        }
        let fail = |reason: String| StormError::execution(ExecutionContext::Local, command_line, reason);

        debug!(dir = %working_directory.display(), command = command_line, "spawning");
        let mut command = Command::new(SHELL);
        command
            .arg("-c")
            .arg(command_line)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|e| {
            fail(format!(
                "failed to start in {}: {}",
                working_directory.display(),
                e
            ))
        })?;
        let mut group = ProcessGroup(child.id());
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => return Err(fail("output pipes were not captured".to_string())),
        };

        let status = match self.timeout {
            None => stream_and_wait(&mut child, stdout, stderr, sink).await,
            Some(limit) => {
                let outcome =
                    time::timeout(limit, stream_and_wait(&mut child, stdout, stderr, sink)).await;
                match outcome {
                    Ok(status) => status,
                    Err(_) => {
                        drop(group);
                        let _ = child.kill().await;
                        return Err(fail(format!("timed out after {}s", limit.as_secs_f64())));
                    }
                }
            }
        }
        .map_err(|e| fail(e.to_string()))?;
        // The shell has been reaped; leftovers it detached from our pipes are its business.
        group.release();

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(StormError::exited(ExecutionContext::Local, command_line, code, "")),
            None => Err(fail(format!("terminated abnormally ({})", status))),
        }
    }
}

/// Kills a shell's process group on drop unless released first.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn release(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            kill_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // The shell was spawned with `process_group(0)`, so its pid is the group id.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Drains both pipes to EOF, and only then reaps the child.
async fn stream_and_wait(
    child: &mut Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    sink: &dyn OutputSink,
) -> std::io::Result<ExitStatus> {
    let (out, err) = join(
        drain(stdout, Stream::Stdout, sink),
        drain(stderr, Stream::Stderr, sink),
    )
    .await;
    out.map_err(|e| std::io::Error::new(e.kind(), format!("error while streaming stdout: {}", e)))?;
    err.map_err(|e| std::io::Error::new(e.kind(), format!("error while streaming stderr: {}", e)))?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Capture;

    #[tokio::test]
    async fn test_streams_both_outputs() {
        let capture = Capture::new();
        CommandExecutor::new()
            .execute(Path::new("."), "echo out; echo err 1>&2", &capture)
            .await
            .unwrap();
        assert_eq!(capture.stream(Stream::Stdout), vec!["out"]);
        assert_eq!(capture.stream(Stream::Stderr), vec!["err"]);
    }

    #[tokio::test]
    async fn test_delegates_to_shell() {
        let capture = Capture::new();
        CommandExecutor::new()
            .execute(
                Path::new("."),
                "echo abc | tr a x && for i in 1 2; do echo $i; done",
                &capture,
            )
            .await
            .unwrap();
        assert_eq!(capture.stream(Stream::Stdout), vec!["xbc", "1", "2"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let capture = Capture::new();
        let err = CommandExecutor::new()
            .execute(Path::new("."), "echo partial; exit 3", &capture)
            .await
            .unwrap_err();
        assert!(matches!(err, StormError::Execution { .. }));
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("exited with status 3"));
        // Output produced before the failure is not lost.
        assert_eq!(capture.stream(Stream::Stdout), vec!["partial"]);
    }

    #[tokio::test]
    async fn test_empty_command_is_noop() {
        let capture = Capture::new();
        CommandExecutor::new()
            .execute(Path::new("/definitely/not/here"), "   ", &capture)
            .await
            .unwrap();
        assert!(capture.lines().is_empty());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory_and_leaves_cwd_alone() {
        let dir = tempfile::tempdir().unwrap();
        let before = std::env::current_dir().unwrap();
        let capture = Capture::new();

        CommandExecutor::new()
            .execute(dir.path(), "pwd", &capture)
            .await
            .unwrap();
        let printed = std::fs::canonicalize(&capture.stream(Stream::Stdout)[0]).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(std::env::current_dir().unwrap(), before);

        let _ = CommandExecutor::new()
            .execute(dir.path(), "false", &capture)
            .await;
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_error() {
        let before = std::env::current_dir().unwrap();
        let err = CommandExecutor::new()
            .execute(Path::new("/definitely/not/here"), "true", &Capture::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert_eq!(err.exit_code(), None);
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = std::time::Instant::now();
        let err = CommandExecutor::new()
            .with_timeout(Some(Duration::from_millis(200)))
            .execute(Path::new("."), "sleep 10", &Capture::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Alive and not a zombie waiting for a reaper.
    #[cfg(target_os = "linux")]
    fn running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandExecutor::new()
            .with_timeout(Some(Duration::from_millis(300)))
            .execute(dir.path(), "sleep 30 & echo $! > pid; wait", &Capture::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let pid = std::fs::read_to_string(dir.path().join("pid")).unwrap();
        let pid = pid.trim();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while running(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(pid), "background job {} outlived its step", pid);
    }
}

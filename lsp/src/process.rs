//! Process supervisor: owns the server child and its termination ladder.
//!
//! Spawning never retries: a binary that cannot launch is a configuration
//! problem, reported once as [`LspError::Spawn`].

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::error::LspError;

/// The three pipes of a freshly spawned server.
pub(crate) struct ServerPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub(crate) struct ServerProcess {
    child: Child,
    program: String,
}

impl ServerProcess {
    /// Spawn `command` in `cwd` with all three standard streams piped.
    pub fn spawn(command: &[String], cwd: &Path) -> Result<(Self, ServerPipes), LspError> {
        let Some((program, args)) = command.split_first() else {
            return Err(LspError::Spawn {
                command: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty server command"),
            });
        };

        let spawn_error = |source: io::Error| LspError::Spawn {
            command: program.clone(),
            source,
        };

        let resolved = which::which(program).map_err(|e| {
            spawn_error(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program} not found in PATH: {e}"),
            ))
        })?;

        tracing::debug!(program = %resolved.display(), ?args, cwd = %cwd.display(), "spawning language server");

        let mut child = Command::new(&resolved)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let missing = |name: &str| spawn_error(io::Error::other(format!("no {name} from child")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok((
            Self {
                child,
                program: program.clone(),
            },
            ServerPipes {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    /// OS process id; `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Ask the process to exit (SIGTERM on Unix, hard kill elsewhere).
    pub fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                return Ok(());
            };
            let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
            // SAFETY: kill(2) has no memory-safety preconditions; pid is our own child.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    /// Kill the process and reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    /// Wait up to `timeout` for exit. `None` means the bound elapsed.
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::debug!(program = %self.program, "wait failed: {e}");
                None
            }
            Err(_) => None,
        }
    }

    /// Bring the process down: optional natural-exit wait, then SIGTERM,
    /// then kill.
    pub async fn stop(&mut self, exit_wait: Option<Duration>, terminate_wait: Duration) {
        if let Some(wait) = exit_wait
            && self.wait(wait).await.is_some()
        {
            return;
        }
        if self.has_exited() {
            return;
        }

        tracing::debug!(program = %self.program, "server still running, terminating");
        if let Err(e) = self.terminate() {
            tracing::debug!(program = %self.program, "terminate failed: {e}");
        }
        if self.wait(terminate_wait).await.is_some() {
            return;
        }

        tracing::debug!(program = %self.program, "server ignored SIGTERM, killing");
        if let Err(e) = self.kill().await {
            tracing::warn!(program = %self.program, "kill failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_spawn_missing_binary_is_spawn_error() {
        let result = ServerProcess::spawn(
            &cmd(&["definitely-not-a-language-server-xyz"]),
            Path::new("."),
        );
        match result {
            Err(LspError::Spawn { command, source }) => {
                assert_eq!(command, "definitely-not-a-language-server-xyz");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            Err(other) => panic!("expected Spawn, got {other:?}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[test]
    fn test_spawn_empty_command_is_spawn_error() {
        assert!(matches!(
            ServerProcess::spawn(&[], Path::new(".")),
            Err(LspError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_times_out_then_terminate_stops_child() {
        let (mut process, _pipes) =
            ServerProcess::spawn(&cmd(&["sleep", "30"]), Path::new(".")).unwrap();
        assert!(process.id().is_some());

        assert!(process.wait(Duration::from_millis(50)).await.is_none());
        assert!(!process.has_exited());

        process.terminate().unwrap();
        let status = process.wait(Duration::from_secs(5)).await;
        assert!(status.is_some_and(|s| !s.success()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_kill_when_sigterm_ignored() {
        let (mut process, _pipes) = ServerProcess::spawn(
            &cmd(&["sh", "-c", "trap '' TERM; exec sleep 30"]),
            Path::new("."),
        )
        .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        process.stop(None, Duration::from_millis(100)).await;
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_returns_after_natural_exit() {
        let (mut process, _pipes) =
            ServerProcess::spawn(&cmd(&["sh", "-c", "exit 0"]), Path::new(".")).unwrap();
        process
            .stop(Some(Duration::from_secs(5)), Duration::from_millis(100))
            .await;
        assert!(process.has_exited());
    }
}

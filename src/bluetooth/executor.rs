//! Command executor: one external process per call, bounded by a deadline
//!
//! Output is read in chunks rather than lines because interactive prompts
//! (`Enter PIN code:`) are written without a trailing newline. Each chunk is
//! shown to the pairing guard as soon as it arrives.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::bluetooth::PairingGuard;

const READ_CHUNK: usize = 1024;

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub elapsed: Duration,
}

impl RawOutput {
    /// Whether the process exited with status zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executor failures. Signalled, never panicked.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command interrupted")]
    Interrupted,

    #[error("I/O error while reading command output: {0}")]
    Io(#[from] io::Error),
}

impl ExecError {
    /// True when the program itself could not be found or executed
    pub fn is_environment_missing(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. }
                if matches!(source.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied)
        )
    }
}

enum Finished {
    Done(io::Result<(String, String, ExitStatus)>),
    TimedOut,
    Interrupted,
}

/// Runs a single control-interface program
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
}

impl CommandExecutor {
    /// Create an executor for `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Spawn the program with `args` and wait for it, at most `timeout`.
    ///
    /// The child is killed if the deadline passes or the guard fires. No
    /// retries happen here.
    pub async fn run(
        &self,
        args: &[&str],
        timeout: Duration,
        guard: &PairingGuard,
    ) -> Result<RawOutput, ExecError> {
        if timeout.is_zero() {
            return Err(ExecError::InvalidTimeout);
        }
        if guard.is_cancelled() {
            return Err(ExecError::Interrupted);
        }

        log::debug!("Running {} {}", self.program.display(), args.join(" "));
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = {
            let collect = async {
                let (out, err) = tokio::join!(drain(stdout, guard), drain(stderr, guard));
                let status = child.wait().await?;
                Ok::<_, io::Error>((out?, err?, status))
            };

            tokio::select! {
                biased;
                () = guard.cancelled() => Finished::Interrupted,
                res = tokio::time::timeout(timeout, collect) => match res {
                    Ok(done) => Finished::Done(done),
                    Err(_) => Finished::TimedOut,
                },
            }
        };

        match finished {
            Finished::Done(_) if guard.is_cancelled() => Err(ExecError::Interrupted),
            Finished::Done(done) => {
                let (stdout, stderr, status) = done?;
                let output = RawOutput {
                    stdout,
                    stderr,
                    code: status.code(),
                    elapsed: started.elapsed(),
                };
                log::trace!("{} exited with {:?}:\n{}", self.program.display(), output.code, output.combined());
                Ok(output)
            }
            Finished::TimedOut => {
                log::debug!("{} timed out after {:?}, killing", self.program.display(), timeout);
                let _ = child.kill().await;
                Err(ExecError::Timeout(timeout))
            }
            Finished::Interrupted => {
                log::debug!("{} interrupted, killing", self.program.display());
                let _ = child.kill().await;
                Err(ExecError::Interrupted)
            }
        }
    }
}

/// Locate `program` the way process spawning will: paths with a directory
/// component are taken as they are, bare names are searched on `PATH`.
/// Returns `None` when nothing executable is found.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Read a pipe to the end, showing every chunk to the guard as it arrives
async fn drain<R>(reader: Option<R>, guard: &PairingGuard) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut captured = String::new();
    let mut pending = String::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));

        // the unterminated tail matters: prompts do not end in a newline
        guard.inspect(&pending);

        if let Some(pos) = pending.rfind('\n') {
            captured.extend(pending.drain(..=pos));
        }
    }

    captured.push_str(&pending);
    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> CommandExecutor {
        CommandExecutor::new("/bin/sh")
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let guard = PairingGuard::new();
        let out = sh()
            .run(&["-c", "echo hello; echo oops >&2; exit 3"], Duration::from_secs(5), &guard)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_environment_missing() {
        let guard = PairingGuard::new();
        let err = CommandExecutor::new("/nonexistent/btwake-control")
            .run(&["info"], Duration::from_secs(1), &guard)
            .await
            .unwrap_err();
        assert!(err.is_environment_missing());
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program(Path::new("/bin/sh")), Some(PathBuf::from("/bin/sh")));
        assert!(resolve_program(Path::new("sh")).is_some());
        assert_eq!(resolve_program(Path::new("btwake-no-such-control-program")), None);
        assert_eq!(resolve_program(Path::new("/nonexistent/bluetoothctl")), None);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let guard = PairingGuard::new();
        let err = sh().run(&["-c", "true"], Duration::ZERO, &guard).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidTimeout));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let guard = PairingGuard::new();
        let started = Instant::now();
        let err = sh()
            .run(&["-c", "sleep 30"], Duration::from_millis(200), &guard)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unterminated_prompt_interrupts() {
        let guard = PairingGuard::new();
        let started = Instant::now();
        let err = sh()
            .run(&["-c", "printf 'Enter PIN code: '; sleep 30"], Duration::from_secs(20), &guard)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Interrupted));
        assert!(guard.pairing_requested().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

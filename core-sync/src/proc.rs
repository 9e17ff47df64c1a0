//! Synchronous child-process helpers.
//!
//! External tools (fpcalc, ffmpeg) are invoked one file at a time; their
//! output is fully drained before the next file, and each invocation has a
//! hard timeout enforced by polling `try_wait` and killing on expiry.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Find an executable by walking the `PATH` entries.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

#[derive(Debug)]
pub enum ProcError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Timeout(Duration),
}

impl std::fmt::Display for ProcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcError::Spawn(e) => write!(f, "spawn failed: {e}"),
            ProcError::Wait(e) => write!(f, "wait failed: {e}"),
            ProcError::Timeout(t) => write!(f, "timed out after {}s", t.as_secs()),
        }
    }
}

/// Run a command to completion with a hard timeout, capturing stdout and
/// stderr. On timeout the child is killed and reaped.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, ProcError> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let child = command.spawn().map_err(ProcError::Spawn)?;
    wait_with_timeout(child, timeout)
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<Output, ProcError> {
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = drain(child.stdout.take());
                let stderr = drain(child.stderr.take());
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProcError::Timeout(timeout));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(ProcError::Wait(e)),
        }
    }
}

fn drain<R: Read>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_of_fast_command() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let result = run_with_timeout(cmd, Duration::from_millis(200));
        assert!(matches!(result, Err(ProcError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        assert!(matches!(
            run_with_timeout(cmd, Duration::from_secs(1)),
            Err(ProcError::Spawn(_))
        ));
    }
}

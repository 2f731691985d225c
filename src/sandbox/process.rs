//! Child process execution with a hard deadline.
//!
//! Every tier that spawns something (the script interpreter, the host
//! fallback, the container runtime CLI) goes through [`run_with_deadline`].
//! The child runs in its own process group; if the timer wins the race the
//! whole group gets SIGKILL. Output is drained to the end so a chatty child
//! cannot block on a full pipe, but only the first `max_output` bytes of each
//! stream are kept.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait for the output pipes to close after a kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Raw outcome of a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `128 + signal` when the child died from a signal,
    /// `None` when it was killed at the deadline.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// At least one stream was cut at `max_output`.
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Spawns `command`, feeds it `stdin` (if any), and waits for it to exit or
/// for `timeout` to elapse, whichever comes first.
pub async fn run_with_deadline(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    max_output: usize,
) -> std::io::Result<ProcessOutput> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Feed stdin from a task so a child that never reads cannot stall us
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                debug!("Child stdin closed early: {e}");
            }
            let _ = pipe.shutdown().await;
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout, max_output));
    let stderr_task = tokio::spawn(read_capped(stderr, max_output));

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::time::sleep(timeout) => None,
    };

    let timed_out = status.is_none();
    if timed_out {
        warn!(
            "Child process exceeded {}ms deadline, killing process group",
            timeout.as_millis()
        );
        kill_tree(&mut child).await;
    }

    let (stdout, out_cut) = collect(stdout_task).await;
    let (stderr, err_cut) = collect(stderr_task).await;

    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: status.and_then(exit_code),
        timed_out,
        truncated: out_cut || err_cut,
    })
}

/// Sends SIGKILL to the child's process group, then reaps the child.
pub async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: killpg has no memory-safety preconditions; the group was
        // created for this child by `process_group(0)`.
        let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "killpg({pid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Child already gone: {e}");
    }
}

async fn read_capped<R>(reader: Option<R>, max: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

async fn collect(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            debug!("Output reader failed: {e}");
            (Vec::new(), false)
        }
        Err(_) => {
            // A grandchild outside the group may still hold the pipe open
            abort.abort();
            (Vec::new(), false)
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| 128 + sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

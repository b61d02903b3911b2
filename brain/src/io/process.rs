//! Child process runner with a hard timeout and bounded output capture.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long output readers may keep draining after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(1);
const READER_POLL: Duration = Duration::from_millis(10);

/// The child could not be started at all (missing interpreter, bad cwd, ...).
#[derive(Debug, Error)]
#[error("spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout as lossy UTF-8 with a truncation notice appended when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        with_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    pub fn stderr_text(&self) -> String {
        with_notice(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn with_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// Stdout and stderr are drained on helper threads while the child runs so a
/// chatty child never blocks on a full pipe. At most `output_limit_bytes` per
/// stream are kept; the rest is counted and discarded. A spawn failure is
/// returned as [`SpawnError`].
///
/// On unix the child leads its own process group and a timeout kills the
/// whole group. Readers get [`READER_GRACE`] after the child is gone; a
/// descendant that still holds a pipe open past that is not waited for.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(%program, "spawning child process");
    let mut child = cmd.spawn().map_err(|source| {
        warn!(%program, err = %source, "failed to spawn command");
        SpawnError {
            program: program.clone(),
            source,
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = Reader::spawn(stdout, output_limit_bytes);
    let stderr_reader = Reader::spawn(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let deadline = Instant::now() + READER_GRACE;
    let stdout = stdout_reader.finish(deadline).context("collect stdout")?;
    let stderr = stderr_reader.finish(deadline).context("collect stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_truncated = stdout.dropped,
            stderr_truncated = stderr.dropped,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.kept,
        stderr: stderr.kept,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

/// Kill the child and everything in its process group.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(err = %err, "killpg failed; killing the child only");
            child.kill().context("kill command")
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

/// One output pipe drained on a helper thread into a shared buffer.
struct Reader {
    capture: Arc<Mutex<Capture>>,
    handle: JoinHandle<Result<()>>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(source: R, limit: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = Arc::clone(&capture);
        let handle = thread::spawn(move || read_limited(source, limit, &sink));
        Self { capture, handle }
    }

    /// Wait for EOF until `deadline`, then take whatever was captured.
    fn finish(self, deadline: Instant) -> Result<Capture> {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(READER_POLL);
        }
        if self.handle.is_finished() {
            self.handle
                .join()
                .map_err(|_| anyhow!("output reader thread panicked"))??;
        } else {
            warn!("output pipe still held open by a leftover process; not waiting for it");
        }
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        Ok(std::mem::take(&mut *capture))
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize, capture: &Mutex<Capture>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = capture
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let room = limit.saturating_sub(capture.kept.len());
        let keep = n.min(room);
        capture.kept.extend_from_slice(&chunk[..keep]);
        capture.dropped += n - keep;
    }
}

//! Helpers for running child processes with an optional timeout and bounded output.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process result.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, `None` when killed by a signal or by the timeout.
    pub fn code(&self) -> Option<i32> {
        if self.timed_out {
            return None;
        }
        self.status.code()
    }
}

/// Run a command, capturing stdout and passing stderr through to the terminal.
///
/// Stdout is drained on a separate thread so a chatty child cannot block on a
/// full pipe; bytes beyond `output_limit_bytes` are counted and discarded.
/// With `echo_stdout` every byte is also copied to our own stdout as it
/// arrives, truncated or not. With no `timeout` the child may run indefinitely.
#[instrument(
    skip_all,
    fields(timeout_secs = ?timeout.map(|t| t.as_secs()), output_limit_bytes = output_limit_bytes)
)]
pub fn run_command(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    echo_stdout: bool,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stdout_handle = thread::spawn(move || {
        if echo_stdout {
            read_stream_limited(stdout, output_limit_bytes, Some(io::stdout()))
        } else {
            read_stream_limited(stdout, output_limit_bytes, None::<io::Sink>)
        }
    });

    let mut timed_out = false;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
    };

    let (stdout, stdout_truncated) = match stdout_handle.join() {
        Ok(result) => result.context("join stdout")?,
        Err(_) => return Err(anyhow!("output reader thread panicked")),
    };
    if stdout_truncated > 0 {
        warn!(stdout_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stdout_truncated,
        timed_out,
    })
}

fn read_stream_limited<R: Read, W: Write>(
    mut reader: R,
    limit: usize,
    mut echo: Option<W>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        if let Some(sink) = echo.as_mut() {
            sink.write_all(&chunk[..n]).context("echo output")?;
            sink.flush().context("flush echoed output")?;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

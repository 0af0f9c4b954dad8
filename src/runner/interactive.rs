//! Live-stdio execution.
//!
//! Descriptors are normally inherited or redirected straight into the
//! child. A stream bound to an in-memory buffer instead gets a pipe and a
//! drain thread that owns the read side and is the buffer's only writer;
//! the call returns only after the child has exited *and* every drain has
//! hit EOF, so no trailing output is lost.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{DrydockError, Result};
use crate::sandbox::SandboxInvocation;

pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

pub fn shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Where one of the child's standard streams goes.
#[derive(Debug)]
pub enum IoTarget {
    Inherit,
    Null,
    File(File),
    Buffer(SharedBuffer),
}

/// Stream bindings for `run_interactive`; `None` inherits.
#[derive(Debug, Default)]
pub struct InteractiveIo {
    pub stdin: Option<IoTarget>,
    pub stdout: Option<IoTarget>,
    pub stderr: Option<IoTarget>,
}

impl InteractiveIo {
    /// Inherit all three streams from the calling process.
    pub fn inherit() -> Self {
        Self::default()
    }

    /// Capture stdout into `buffer`, leave stderr on the terminal.
    pub fn capture_stdout(buffer: SharedBuffer) -> Self {
        Self {
            stdout: Some(IoTarget::Buffer(buffer)),
            ..Self::default()
        }
    }
}

fn direct(target: IoTarget) -> Stdio {
    match target {
        IoTarget::Inherit => Stdio::inherit(),
        IoTarget::Null => Stdio::null(),
        IoTarget::File(f) => Stdio::from(f),
        // Callers route buffers through pipes before getting here.
        IoTarget::Buffer(_) => Stdio::piped(),
    }
}

/// Copy `source` into `sink` until EOF. Adapted from the batch tee reader,
/// but appending to a shared buffer instead of a private one.
fn spawn_drain<R: Read + Send + 'static>(mut source: R, sink: SharedBuffer) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => match sink.lock() {
                    Ok(mut out) => out.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                },
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn spawn_feeder<W: Write + Send + 'static>(mut sink: W, source: SharedBuffer) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let data = source.lock().map(|d| d.clone()).unwrap_or_default();
        // A child that exits without reading its input closes the pipe.
        let _ = sink.write_all(&data);
    })
}

pub(crate) fn run_interactive<S: AsRef<OsStr>>(
    invocation: &SandboxInvocation,
    command: &[S],
    env: &BTreeMap<String, String>,
    io: InteractiveIo,
) -> Result<bool> {
    let mut cmd = invocation.to_command(command, env);

    let stdout_buffer = match io.stdout {
        Some(IoTarget::Buffer(b)) => Some(b),
        other => {
            cmd.stdout(direct(other.unwrap_or(IoTarget::Inherit)));
            None
        }
    };
    let stderr_buffer = match io.stderr {
        Some(IoTarget::Buffer(b)) => Some(b),
        other => {
            cmd.stderr(direct(other.unwrap_or(IoTarget::Inherit)));
            None
        }
    };
    let stdin_buffer = match io.stdin {
        Some(IoTarget::Buffer(b)) => Some(b),
        // With stdout captured there is no terminal conversation to have.
        _ if stdout_buffer.is_some() => {
            cmd.stdin(Stdio::null());
            None
        }
        other => {
            cmd.stdin(direct(other.unwrap_or(IoTarget::Inherit)));
            None
        }
    };
    if stdout_buffer.is_some() {
        cmd.stdout(Stdio::piped());
    }
    if stderr_buffer.is_some() {
        cmd.stderr(Stdio::piped());
    }
    if stdin_buffer.is_some() {
        cmd.stdin(Stdio::piped());
    }

    debug!("Spawning interactive: {:?}", cmd);
    let mut child = cmd.spawn().map_err(|e| {
        DrydockError::SandboxError(format!(
            "failed to launch {}: {}",
            cmd.get_program().to_string_lossy(),
            e
        ))
    })?;

    let mut tasks = Vec::new();
    if let (Some(buffer), Some(pipe)) = (stdin_buffer, child.stdin.take()) {
        tasks.push(spawn_feeder(pipe, buffer));
    }
    if let (Some(buffer), Some(pipe)) = (stdout_buffer, child.stdout.take()) {
        tasks.push(spawn_drain(pipe, buffer));
    }
    if let (Some(buffer), Some(pipe)) = (stderr_buffer, child.stderr.take()) {
        tasks.push(spawn_drain(pipe, buffer));
    }

    let status = child
        .wait()
        .map_err(|e| DrydockError::SandboxError(format!("failed to wait for sandbox: {}", e)))?;
    for task in tasks {
        task.join()
            .map_err(|_| DrydockError::SandboxError("output drain thread panicked".to_string()))?;
    }
    debug!("Interactive sandbox exited with: {:?}", status);
    Ok(status.success())
}

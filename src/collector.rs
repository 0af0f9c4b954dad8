//! Batch subprocess execution with merged output capture.
//!
//! Each output pipe gets a reader thread that forwards chunks over a
//! channel; `wait` consumes the channel on the calling thread, so the
//! merged stream is the order in which chunks arrived. Ordering between
//! stdout and stderr is best effort, content is not.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{DrydockError, Result};
use crate::sandbox::SandboxInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

type Chunk = (Stream, Vec<u8>);

/// Read `source` to EOF in 8 KB chunks, forwarding each over `tx`.
fn spawn_chunk_reader<R: Read + Send + 'static>(
    mut source: R,
    stream: Stream,
    tx: mpsc::Sender<Chunk>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

pub struct OutputCollector {
    child: Child,
    rx: mpsc::Receiver<Chunk>,
    readers: Vec<JoinHandle<()>>,
    verbose: bool,
    tee: Option<Box<dyn Write + Send>>,
    merged: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: Option<ExitStatus>,
}

impl OutputCollector {
    /// Start `command` inside `invocation` with exactly `env` as its
    /// environment. When `verbose`, output is echoed live to `tee`, or to
    /// the host's stdout/stderr when no tee is given.
    pub fn start<S: AsRef<OsStr>>(
        invocation: &SandboxInvocation,
        command: &[S],
        env: &BTreeMap<String, String>,
        verbose: bool,
        tee: Option<Box<dyn Write + Send>>,
    ) -> Result<Self> {
        let cmd = invocation.to_command(command, env);
        Self::spawn(cmd, verbose, tee)
    }

    pub fn spawn(
        mut cmd: Command,
        verbose: bool,
        tee: Option<Box<dyn Write + Send>>,
    ) -> Result<Self> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!("Spawning: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            DrydockError::SandboxError(format!(
                "failed to launch {}: {}",
                cmd.get_program().to_string_lossy(),
                e
            ))
        })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_chunk_reader(out, Stream::Stdout, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_chunk_reader(err, Stream::Stderr, tx.clone()));
        }

        Ok(Self {
            child,
            rx,
            readers,
            verbose,
            tee,
            merged: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: None,
        })
    }

    /// Block until both pipes are drained and the child has exited.
    pub fn wait(&mut self) -> Result<bool> {
        if let Some(status) = self.status {
            return Ok(status.success());
        }

        // Ends once both reader threads have dropped their senders.
        for (stream, chunk) in self.rx.iter() {
            if self.verbose {
                match (&mut self.tee, stream) {
                    (Some(tee), _) => {
                        let _ = tee.write_all(&chunk);
                        let _ = tee.flush();
                    }
                    (None, Stream::Stdout) => {
                        let mut out = std::io::stdout();
                        let _ = out.write_all(&chunk);
                        let _ = out.flush();
                    }
                    (None, Stream::Stderr) => {
                        let mut err = std::io::stderr();
                        let _ = err.write_all(&chunk);
                        let _ = err.flush();
                    }
                }
            }
            self.merged.extend_from_slice(&chunk);
            match stream {
                Stream::Stdout => self.stdout.extend_from_slice(&chunk),
                Stream::Stderr => self.stderr.extend_from_slice(&chunk),
            }
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }

        let status = self
            .child
            .wait()
            .map_err(|e| DrydockError::SandboxError(format!("failed to wait for sandbox: {}", e)))?;
        debug!("Sandbox exited with: {:?}", status);
        self.status = Some(status);
        Ok(status.success())
    }

    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Interleaved stdout and stderr. Only complete after `wait`.
    pub fn merged_output(&self) -> String {
        String::from_utf8_lossy(&self.merged).into_owned()
    }

    pub fn merged_bytes(&self) -> &[u8] {
        &self.merged
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

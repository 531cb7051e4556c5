//! Lifecycle of a spawned ffmpeg/ffprobe subprocess.
//!
//! Every process is spawned with all three standard streams piped. Stdin and
//! stdout are handed to the caller; stderr is drained on a background thread
//! into a bounded [`StderrTail`] so diagnostic chatter can never fill the pipe
//! or grow without limit.

use std::{
    collections::VecDeque,
    io::{self, Read},
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    threads::spawn_thread,
    types::{DecodeError, Phase},
};

const STDERR_CHUNK_BYTES: usize = 4096;
/// Sleep between `try_wait` polls while reaping a process.
pub(crate) const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Ring buffer holding the most recent bytes a process wrote to stderr.
pub struct StderrTail {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(STDERR_CHUNK_BYTES))),
            capacity,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let Ok(mut buf) = self.buf.lock() else {
            return;
        };
        let overflow = (buf.len() + bytes.len()).saturating_sub(self.capacity);
        buf.drain(..overflow);
        buf.extend(bytes);
    }

    /// Lossy UTF-8 copy of the retained bytes.
    pub fn snapshot(&self) -> String {
        match self.buf.lock() {
            Ok(buf) => {
                let (head, tail) = buf.as_slices();
                let mut bytes = Vec::with_capacity(buf.len());
                bytes.extend_from_slice(head);
                bytes.extend_from_slice(tail);
                String::from_utf8_lossy(&bytes).trim_end().to_string()
            }
            Err(_) => String::new(),
        }
    }
}

/// Cloneable handle able to terminate a process owned by a [`ProcessHandle`].
#[derive(Clone)]
pub struct ProcessKiller {
    child: Arc<Mutex<Child>>,
}

impl ProcessKiller {
    /// Forcibly terminate the process. Killing an already exited process is a no-op.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            match child.kill() {
                Ok(()) => debug!(pid = child.id(), "killed subprocess"),
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                Err(err) => warn!(pid = child.id(), "failed to kill subprocess: {err}"),
            }
        }
    }
}

/// A live subprocess with piped stdin, stdout and a captured stderr tail.
pub struct ProcessHandle {
    program: String,
    phase: Phase,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<StderrTail>,
    stderr_drain: Option<JoinHandle<()>>,
    reaped: bool,
}

impl ProcessHandle {
    /// Start `cmd` without waiting for it. Standard streams are always piped.
    pub fn spawn(
        mut cmd: Command,
        phase: Phase,
        stderr_capacity: usize,
    ) -> Result<Self, DecodeError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        debug!(
            program = %program,
            args = ?cmd.get_args().collect::<Vec<_>>(),
            "spawning subprocess"
        );
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| DecodeError::Spawn {
            phase,
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(StderrTail::new(stderr_capacity));
        let stderr_drain = match child.stderr.take() {
            Some(stderr) => {
                let tail = stderr_tail.clone();
                match spawn_thread(format!("{program}-stderr"), move || drain_stderr(stderr, &tail))
                {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(DecodeError::Io {
                            phase,
                            program,
                            source: err,
                        });
                    }
                }
            }
            None => None,
        };

        Ok(Self {
            program,
            phase,
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout,
            stderr_tail,
            stderr_drain,
            reaped: false,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn stderr_tail(&self) -> Arc<StderrTail> {
        self.stderr_tail.clone()
    }

    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            child: self.child.clone(),
        }
    }

    /// Block until the process exits and release its resources.
    pub fn wait(self) -> Result<ExitStatus, DecodeError> {
        let program = self.program.clone();
        self.wait_until(None)?
            .ok_or_else(|| DecodeError::Other(anyhow::anyhow!("{program} did not exit")))
    }

    /// Wait for exit until `deadline`. Returns `Ok(None)` once the deadline has
    /// passed, in which case the process has been killed and reaped.
    pub fn wait_until(
        mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<ExitStatus>, DecodeError> {
        // Closing our ends first lets a process blocked on them make progress.
        drop(self.stdin.take());
        drop(self.stdout.take());

        let status = loop {
            if let Some(status) = self.try_wait()? {
                break Some(status);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.killer().kill();
                self.blocking_wait()?;
                break None;
            }
            thread::sleep(PROCESS_POLL_INTERVAL);
        };
        self.reaped = true;
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
        Ok(status)
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>, DecodeError> {
        let mut child = self.lock_child()?;
        child.try_wait().map_err(|source| DecodeError::Io {
            phase: self.phase,
            program: self.program.clone(),
            source,
        })
    }

    fn blocking_wait(&self) -> Result<ExitStatus, DecodeError> {
        let mut child = self.lock_child()?;
        child.wait().map_err(|source| DecodeError::Io {
            phase: self.phase,
            program: self.program.clone(),
            source,
        })
    }

    fn lock_child(&self) -> Result<std::sync::MutexGuard<'_, Child>, DecodeError> {
        self.child
            .lock()
            .map_err(|_| DecodeError::Other(anyhow::anyhow!("{} handle poisoned", self.program)))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Error paths drop the handle without waiting; don't leave a zombie behind.
        self.killer().kill();
        if let Ok(mut child) = self.child.lock() {
            let _ = child.wait();
        }
    }
}

fn drain_stderr(mut stderr: impl Read, tail: &StderrTail) {
    let mut chunk = [0u8; STDERR_CHUNK_BYTES];
    loop {
        match stderr.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("stderr drain stopped: {err}");
                break;
            }
        }
    }
}

//! Child-process channel with non-blocking, line-buffered reads.
//!
//! Owns a spawned player process. All of its output (stdout and stderr
//! merged) is consumed by dedicated reader threads — one OS-level consumer
//! per pipe — which push whole lines into a single channel. Callers take
//! lines from that channel with a bounded wait, so a marker line can never be
//! split across two consumers. Command loops and the status monitor alternate
//! as the channel consumer: the monitor is always stopped and joined before a
//! foreground read loop runs.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::error::{PlayerError, Result};

/// A spawned child process with mutex-guarded line writes and bounded-wait
/// line reads.
#[derive(Debug)]
pub struct ProcessChannel {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    lines: Receiver<String>,
    alive: AtomicBool,
}

impl ProcessChannel {
    /// Spawn `program` with `args`, capturing stdin, stdout and stderr.
    ///
    /// Fails with [`PlayerError::Initialization`] if the executable cannot be
    /// found or fails to start.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PlayerError::Initialization(format!(
                    "{program} binary not found. Is the player installed?"
                )),
                _ => PlayerError::Initialization(format!("failed to spawn {program}: {e}")),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PlayerError::Initialization(format!("no stdout pipe for {program}"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            PlayerError::Initialization(format!("no stderr pipe for {program}"))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            PlayerError::Initialization(format!("no stdin pipe for {program}"))
        })?;

        let (tx, rx) = unbounded();
        spawn_reader(stdout, tx.clone());
        spawn_reader(stderr, tx);

        tracing::debug!(program, "player process spawned");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            lines: rx,
            alive: AtomicBool::new(true),
        })
    }

    /// Write one line to the child's stdin. A newline is appended and the
    /// pipe is flushed. Safe to call concurrently with [`read`](Self::read)
    /// from another thread.
    pub fn write_line(&self, line: &str) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(PlayerError::Terminated);
        }
        let mut guard = self.stdin.lock().unwrap();
        let Some(stdin) = guard.as_mut() else {
            return Err(PlayerError::Terminated);
        };
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .map_err(|e| PlayerError::Command(format!("write to player failed: {e}")))
    }

    /// Return all line output that arrives within `max_wait`, newline
    /// terminated. An empty string (not an error) means nothing arrived —
    /// callers poll in their own deadline loops.
    pub fn read(&self, max_wait: Duration) -> Result<String> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(PlayerError::Terminated);
        }
        let mut out = String::new();
        match self.lines.recv_timeout(max_wait) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            // Disconnected means the process closed its output; the caller's
            // deadline loop turns persistent silence into a typed error.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Ok(out);
            }
        }
        while let Ok(line) = self.lines.try_recv() {
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Kill the child and wait for it to exit. Idempotent; subsequent
    /// [`write_line`](Self::write_line) and [`read`](Self::read) calls fail
    /// with [`PlayerError::Terminated`].
    pub fn terminate(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            // Closing stdin first lets a well-behaved player exit on its own.
            self.stdin.lock().unwrap().take();
            let mut child = self.child.lock().unwrap();
            if let Err(e) = child.kill() {
                tracing::debug!("kill after exit: {e}");
            }
            match child.wait() {
                Ok(status) => tracing::debug!(%status, "player process exited"),
                Err(e) => tracing::warn!("wait for player process failed: {e}"),
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_reader<R>(pipe: R, tx: Sender<String>)
where
    R: std::io::Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("player output pipe closed: {e}");
                    break;
                }
            }
        }
    });
}

//! Owned child processes with SIGTERM -> SIGKILL escalation.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// One entry of a session's process history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub label: String,
    pub pid: Option<u32>,
}

/// Append-only record of every process a session spawned, readable from
/// outside the worker that owns the handles.
#[derive(Debug, Clone, Default)]
pub struct ProcessLedger(Arc<Mutex<Vec<ProcessRecord>>>);

impl ProcessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, record: ProcessRecord) {
        if let Ok(mut records) = self.0.lock() {
            records.push(record);
        }
    }

    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        self.0.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.snapshot().into_iter().filter_map(|r| r.pid).collect()
    }
}

pub struct OwnedProcess {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

impl OwnedProcess {
    fn new(label: String, mut child: Child) -> Self {
        let stdin = child.stdin.take();
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        Self {
            label,
            child,
            stdin,
            stderr,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Writes `text` to stdin and closes it so the process sees EOF.
    pub async fn feed_input(&mut self, text: &str) -> io::Result<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await
        // stdin is dropped here, closing the pipe
    }

    pub fn close_input(&mut self) {
        self.stdin.take();
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Everything the process wrote to stderr. Only meaningful once it exited.
    pub async fn stderr_text(&mut self) -> String {
        let Some(task) = self.stderr.take() else {
            return String::new();
        };
        match timeout(STDERR_DRAIN, task).await {
            Ok(Ok(text)) => text.trim().to_string(),
            _ => String::new(),
        }
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            // Process may have already exited
            if e != nix::errno::Errno::ESRCH {
                tracing::debug!(process = %self.label, pid, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        // Windows has no SIGTERM equivalent - terminate immediately
        let _ = self.child.start_kill();
    }

    fn force_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(process = %self.label, error = %e, "kill failed");
        }
    }
}

/// The processes owned by one synthesis/playback attempt, in spawn order.
pub struct ProcessSet {
    procs: Vec<OwnedProcess>,
    ledger: ProcessLedger,
}

impl ProcessSet {
    pub fn new(ledger: ProcessLedger) -> Self {
        Self {
            procs: Vec::new(),
            ledger,
        }
    }

    /// Takes ownership of a freshly spawned child; returns its index.
    pub fn adopt(&mut self, label: impl Into<String>, child: Child) -> usize {
        let label = label.into();
        let pid = child.id();
        tracing::debug!(process = %label, ?pid, "adopted process");
        self.ledger.record(ProcessRecord {
            label: label.clone(),
            pid,
        });
        self.procs.push(OwnedProcess::new(label, child));
        self.procs.len() - 1
    }

    pub fn get_mut(&mut self, index: usize) -> &mut OwnedProcess {
        &mut self.procs[index]
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Tears every process down within roughly `2 * grace`:
    ///
    /// 1. close every stdin and send SIGTERM to whatever is still running
    /// 2. wait up to `grace` for them to exit, SIGKILL the rest
    /// 3. wait up to `grace` again for reaping; anything still alive is
    ///    abandoned rather than awaited
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.procs.is_empty() {
            return;
        }

        let mut running = Vec::new();
        for (index, process) in self.procs.iter_mut().enumerate() {
            process.close_input();
            if !process.has_exited() {
                process.terminate();
                running.push(index);
            }
        }

        let deadline = Instant::now() + grace;
        let mut stubborn = Vec::new();
        for index in running {
            let process = &mut self.procs[index];
            if timeout_at(deadline, process.child.wait()).await.is_err() {
                tracing::debug!(process = %process.label, "still alive after SIGTERM, killing");
                process.force_kill();
                stubborn.push(index);
            }
        }

        let deadline = Instant::now() + grace;
        for index in stubborn {
            let process = &mut self.procs[index];
            if timeout_at(deadline, process.child.wait()).await.is_err() {
                tracing::warn!(process = %process.label, pid = ?process.pid(), "process refused to die, abandoning it");
            }
        }

        // Dropped handles are killed again (kill_on_drop) and reaped by the runtime
        self.procs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn")
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn shutdown_responds_to_sigterm() {
        let ledger = ProcessLedger::new();
        let mut set = ProcessSet::new(ledger.clone());
        set.adopt("sleep", spawn("sleep", &["30"]));

        let started = std::time::Instant::now();
        set.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(set.is_empty());
        assert_eq!(ledger.pids().len(), 1);
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn shutdown_kills_processes_ignoring_sigterm() {
        let mut set = ProcessSet::new(ProcessLedger::new());
        set.adopt(
            "stubborn",
            spawn("sh", &["-c", "trap '' TERM; while true; do sleep 1; done"]),
        );
        // let the trap get installed
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        set.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn feed_input_closes_stdin_and_stderr_is_captured() {
        let mut set = ProcessSet::new(ProcessLedger::new());
        let index = set.adopt("cat", spawn("sh", &["-c", "cat 1>&2; exit 3"]));
        let process = set.get_mut(index);
        process.feed_input("hello").await.unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.stderr_text().await, "hello");
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn shutdown_handles_already_exited() {
        let mut set = ProcessSet::new(ProcessLedger::new());
        set.adopt("true", spawn("true", &[]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        set.shutdown(Duration::from_millis(50)).await;
        assert!(set.is_empty());
    }
}

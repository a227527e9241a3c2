//! Ordered candidate lists: "try each executable in turn until one works".
//!
//! Used for player selection (first player that spawns wins) and for
//! executable discovery (first path that exists and is executable wins).

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

/// A program plus its argument vector, not yet spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Short name for logs ("mpv" rather than "/usr/bin/mpv").
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Builds the command. Children are killed if their handle is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

/// Every failed attempt of a candidate list, in order.
#[derive(Debug, Default)]
pub struct SpawnAttempts(pub Vec<(String, io::Error)>);

impl SpawnAttempts {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SpawnAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no candidates configured");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, err)| format!("{}: {}", name, err))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Spawns the first candidate that starts successfully.
///
/// `configure` sets up stdio for each attempt; it runs once per candidate, so
/// it must hand out a fresh `Stdio` every time.
pub fn spawn_first<F>(
    candidates: &[Invocation],
    mut configure: F,
) -> Result<(Child, Invocation), SpawnAttempts>
where
    F: FnMut(&mut Command) -> io::Result<()>,
{
    let mut attempts = SpawnAttempts::default();
    for candidate in candidates {
        let mut cmd = candidate.command();
        if let Err(e) = configure(&mut cmd) {
            attempts.0.push((candidate.name(), e));
            continue;
        }
        match cmd.spawn() {
            Ok(child) => {
                tracing::debug!(program = %candidate.name(), pid = ?child.id(), "spawned candidate");
                return Ok((child, candidate.clone()));
            }
            Err(e) => {
                tracing::debug!(program = %candidate.name(), error = %e, "candidate failed to spawn");
                attempts.0.push((candidate.name(), e));
            }
        }
    }
    Err(attempts)
}

/// First path that exists and carries an executable bit.
pub fn first_executable<I>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    candidates.into_iter().find(|p| is_executable(p))
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

//! The execution substrate: one capability surface for acting on a host.
//!
//! Every higher layer (discovery, layout construction, init-unit
//! management, topology emission) consumes only the [`Executor`] trait,
//! so the same import code runs against the local machine or a host
//! reached over ssh. The set of variants is closed; callers obtain one
//! via [`connect`] and hold it as `Box<dyn Executor>`.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{SshConfig, SshExecutor};

/// Typed failure outcomes of substrate operations.
///
/// These are wrapped in the [`anyhow`] chain, so callers that need to
/// inspect e.g. the exit status of a failed command can downcast.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A command exited non-zero; stderr is attached.
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed {
        /// Exit status of the command (-1 when killed by a signal).
        status: i32,
        /// Trailing stderr of the command.
        stderr: String,
    },
    /// The command produced output that was not valid UTF-8.
    #[error("command output was not UTF-8")]
    NonUtf8Output,
    /// All configured ssh authentication methods were rejected.
    #[error("ssh authentication failed for {user}@{host}")]
    AuthenticationFailed {
        /// Remote user name.
        user: String,
        /// Remote host.
        host: String,
    },
}

/// Basic facts about a host's operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// Kernel name, e.g. `Linux`.
    pub os: String,
    /// Canonicalized architecture, see [`canonicalize_arch`].
    pub arch: String,
    /// Kernel release string.
    pub version: String,
}

/// Map the various spellings of machine architectures onto the names
/// used for release artifacts.
pub fn canonicalize_arch(machine: &str) -> String {
    match machine.trim() {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Quote a path (or other word) for embedding in a POSIX shell command
/// line. Plain alphanumeric paths pass through unchanged; anything else
/// is single-quoted with embedded single quotes escaped as `'\''`.
pub(crate) fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':'));
    if plain {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r#"'\''"#))
}

/// The uniform capability surface for running commands and manipulating
/// files on a target host.
///
/// Contract: a single owner drives one executor sequentially; instances
/// are never shared across imports or threads. All operations surface
/// failures as structured errors with cause chains preserved; command
/// failures carry stderr via [`ExecError::CommandFailed`].
pub trait Executor {
    /// Run a shell command, capturing stdout.
    fn run(&self, cmd: &str) -> Result<String>;

    /// Run a shell command, feeding `input` to its stdin and capturing
    /// stdout.
    fn run_with_stdin(&self, cmd: &str, input: &[u8]) -> Result<String>;

    /// Start a command detached from the caller, returning its pid. On
    /// the ssh variant the process survives the session closing.
    fn start_background(&self, cmd: &str) -> Result<u32>;

    /// Whether a process with the given pid is alive.
    fn is_running(&self, pid: u32) -> Result<bool>;

    /// Forcibly terminate a process.
    fn kill(&self, pid: u32) -> Result<()>;

    /// Deliver SIGINT to a process.
    fn signal_interrupt(&self, pid: u32) -> Result<()>;

    /// Create a directory (and parents) with the given mode. Idempotent;
    /// a pre-existing directory is left untouched, including its mode.
    fn mkdir(&self, path: &Utf8Path, mode: u32) -> Result<()>;

    /// Whether a file, directory or symlink exists at `path`.
    fn file_exists(&self, path: &Utf8Path) -> Result<bool>;

    /// Remove a file if present.
    fn remove_file(&self, path: &Utf8Path) -> Result<()>;

    /// Recursively remove a directory tree if present.
    fn remove_tree(&self, path: &Utf8Path) -> Result<()>;

    /// Write `content` to `path`, creating parent directories at mode
    /// 0755; the file itself ends up at mode 0644.
    fn upload_content(&self, content: &[u8], path: &Utf8Path) -> Result<()>;

    /// Read the raw bytes of a file.
    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>>;

    /// Copy a local file to `remote`, preserving exact bytes.
    fn upload_file(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<()>;

    /// Copy a remote file to `local`, preserving exact bytes.
    fn download_file(&self, remote: &Utf8Path, local: &Utf8Path) -> Result<()>;

    /// Create or replace a symlink at `link` pointing to `target`.
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()>;

    /// Read the target of a symlink.
    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf>;

    /// Resolve a path to absolute, canonical form.
    fn canonicalize(&self, path: &Utf8Path) -> Result<Utf8PathBuf>;

    /// Bytes available to unprivileged users on the filesystem holding
    /// `path`.
    fn disk_available(&self, path: &Utf8Path) -> Result<u64>;

    /// Query kernel name, architecture and release.
    fn os_info(&self) -> Result<OsInfo>;

    /// Whether a user account exists on the host.
    fn user_exists(&self, name: &str) -> Result<bool>;

    /// Whether a TCP port is free to listen on.
    ///
    /// Locally this is a bind probe on the loopback (bind success means
    /// available) followed by a short dial re-probe. Remotely, listening
    /// state is read from open sockets, privileged tooling first; an
    /// empty result means available, and failure of the privileged probe
    /// is not itself an error.
    fn port_available(&self, port: u16) -> Result<bool>;

    /// Smoke-test the substrate. Must succeed before any other
    /// operation is trusted.
    fn check_reachable(&self) -> Result<()>;

    /// Release sockets and sessions held by the substrate.
    fn close(&self) -> Result<()>;
}

/// Selects which substrate variant [`connect`] builds.
#[derive(Debug, Clone)]
pub enum ExecTarget {
    /// Direct OS calls on the machine running mup.
    Local,
    /// Commands routed over an authenticated ssh session.
    Ssh(SshConfig),
}

/// Build an executor for the given target and verify it is reachable.
pub fn connect(target: &ExecTarget) -> Result<Box<dyn Executor>> {
    let executor: Box<dyn Executor> = match target {
        ExecTarget::Local => Box::new(LocalExecutor::new()),
        ExecTarget::Ssh(config) => Box::new(SshExecutor::connect(config)?),
    };
    executor.check_reachable()?;
    Ok(executor)
}

//! Substrate variant backed by direct OS calls.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use mup_utils::CommandRunExt;

use super::{canonicalize_arch, ExecError, Executor, OsInfo};

/// How long the post-bind dial probe waits for a listener.
const DIAL_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Runs everything directly on the machine mup itself runs on.
#[derive(Debug, Default)]
pub struct LocalExecutor {}

impl LocalExecutor {
    /// Create a local executor.
    pub fn new() -> Self {
        Self::default()
    }

    fn shell(cmd: &str) -> Command {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    }

    fn capture(cmd: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        tracing::trace!("local exec: {cmd}");
        let mut command = Self::shell(cmd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = command.spawn().with_context(|| format!("Spawning `{cmd}`"))?;
        if let Some(input) = stdin {
            // The child may exit without draining stdin; a broken pipe
            // here is reported via the exit status instead.
            let mut handle = child.stdin.take().expect("piped stdin");
            let _ = handle.write_all(input);
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("Waiting for `{cmd}`"))?;
        if !output.status.success() {
            let err = ExecError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            };
            return Err(anyhow::Error::new(err).context(format!("Running `{cmd}`")));
        }
        Ok(output.stdout)
    }

    fn capture_string(cmd: &str, stdin: Option<&[u8]>) -> Result<String> {
        let out = Self::capture(cmd, stdin)?;
        String::from_utf8(out).map_err(|_| ExecError::NonUtf8Output.into())
    }
}

impl Executor for LocalExecutor {
    fn run(&self, cmd: &str) -> Result<String> {
        Self::capture_string(cmd, None)
    }

    fn run_with_stdin(&self, cmd: &str, input: &[u8]) -> Result<String> {
        Self::capture_string(cmd, Some(input))
    }

    #[context("Starting background command")]
    fn start_background(&self, cmd: &str) -> Result<u32> {
        let mut command = Self::shell(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // New process group so the child outlives our controlling
            // terminal and signals aimed at mup.
            .process_group(0);
        let child = command.spawn().with_context(|| format!("Spawning `{cmd}`"))?;
        Ok(child.id())
    }

    fn is_running(&self, pid: u32) -> Result<bool> {
        let Some(pid) = rustix::process::Pid::from_raw(pid as i32) else {
            return Ok(false);
        };
        match rustix::process::test_kill_process(pid) {
            Ok(()) => Ok(true),
            // Alive but owned by someone else
            Err(rustix::io::Errno::PERM) => Ok(true),
            Err(rustix::io::Errno::SRCH) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Probing pid {pid:?}")),
        }
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let pid = rustix::process::Pid::from_raw(pid as i32)
            .ok_or_else(|| anyhow::anyhow!("Invalid pid {pid}"))?;
        rustix::process::kill_process(pid, rustix::process::Signal::Kill)
            .with_context(|| format!("Killing pid {pid:?}"))?;
        Ok(())
    }

    fn signal_interrupt(&self, pid: u32) -> Result<()> {
        let pid = rustix::process::Pid::from_raw(pid as i32)
            .ok_or_else(|| anyhow::anyhow!("Invalid pid {pid}"))?;
        rustix::process::kill_process(pid, rustix::process::Signal::Int)
            .with_context(|| format!("Interrupting pid {pid:?}"))?;
        Ok(())
    }

    #[context("Creating directory {path}")]
    fn mkdir(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        if path.symlink_metadata().is_ok() {
            return Ok(());
        }
        std::fs::create_dir_all(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn file_exists(&self, path: &Utf8Path) -> Result<bool> {
        match path.symlink_metadata() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Checking {path}")),
        }
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing {path}")),
        }
    }

    fn remove_tree(&self, path: &Utf8Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing tree {path}")),
        }
    }

    #[context("Writing {path}")]
    fn upload_content(&self, content: &[u8], path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir(parent, 0o755)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        f.write_all(content)?;
        Ok(())
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        std::fs::read(path).with_context(|| format!("Reading {path}"))
    }

    #[context("Copying {local} to {remote}")]
    fn upload_file(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<()> {
        if let Some(parent) = remote.parent() {
            self.mkdir(parent, 0o755)?;
        }
        std::fs::copy(local, remote)?;
        Ok(())
    }

    #[context("Copying {remote} to {local}")]
    fn download_file(&self, remote: &Utf8Path, local: &Utf8Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            self.mkdir(parent, 0o755)?;
        }
        std::fs::copy(remote, local)?;
        Ok(())
    }

    #[context("Linking {link} -> {target}")]
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()> {
        self.remove_file(link)?;
        symlink(target, link)?;
        Ok(())
    }

    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let target = path
            .read_link_utf8()
            .with_context(|| format!("Reading link {path}"))?;
        Ok(target)
    }

    fn canonicalize(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        match path.canonicalize_utf8() {
            Ok(p) => Ok(p),
            // Like `readlink -f`, tolerate a missing final component.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match (path.parent(), path.file_name()) {
                    (Some(parent), Some(name)) => match parent.canonicalize_utf8() {
                        Ok(parent) => Ok(parent.join(name)),
                        Err(_) => Ok(path.to_owned()),
                    },
                    _ => Ok(path.to_owned()),
                }
            }
            Err(e) => Err(e).with_context(|| format!("Canonicalizing {path}")),
        }
    }

    #[context("Querying free space of {path}")]
    fn disk_available(&self, path: &Utf8Path) -> Result<u64> {
        let st = rustix::fs::statvfs(path.as_std_path())?;
        Ok(st.f_bavail * st.f_frsize)
    }

    fn os_info(&self) -> Result<OsInfo> {
        let uname = rustix::system::uname();
        Ok(OsInfo {
            os: uname.sysname().to_string_lossy().into_owned(),
            arch: canonicalize_arch(&uname.machine().to_string_lossy()),
            version: uname.release().to_string_lossy().into_owned(),
        })
    }

    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(Command::new("id").arg(name).run().is_ok())
    }

    fn port_available(&self, port: u16) -> Result<bool> {
        // Bind probe is authoritative: if we can listen, the port is free.
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let listener = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(_) => return Ok(false),
        };
        drop(listener);
        // Re-probe by dialling; a successful connect means something
        // else grabbed the port between release and now.
        match TcpStream::connect_timeout(&addr, DIAL_PROBE_TIMEOUT) {
            Ok(_) => Ok(false),
            Err(_) => Ok(true),
        }
    }

    fn check_reachable(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

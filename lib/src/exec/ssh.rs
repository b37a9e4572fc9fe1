//! Substrate variant routed over an authenticated ssh session.
//!
//! The shell vocabulary used here is deliberately small and POSIX; see
//! the individual operations. Authentication attempts, in order: a
//! configured private-key file, the ambient key agent's signers (located
//! via `SSH_AUTH_SOCK`, held open for the substrate's lifetime), and
//! finally a password. Host-key verification is permissive in this
//! revision.

use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{canonicalize_arch, shell_quote, ExecError, Executor, OsInfo};

/// Terminator for the `upload_content` here-document.
const HEREDOC_EOF: &str = "MUPEOF";

/// How to reach and authenticate against a remote host.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host name or address.
    pub host: String,
    /// ssh port, normally 22.
    pub port: u16,
    /// Remote user to authenticate as.
    pub user: String,
    /// Private-key file, tried first when set.
    pub key_file: Option<Utf8PathBuf>,
    /// Password, tried after key file and agent.
    pub password: Option<String>,
}

impl SshConfig {
    /// Config for `user@host` on the standard port with agent-only auth.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_file: None,
            password: None,
        }
    }
}

/// Runs everything over one ssh session to a remote host.
pub struct SshExecutor {
    session: ssh2::Session,
    // Keeps the SSH_AUTH_SOCK connection open until we're dropped.
    _agent: Option<ssh2::Agent>,
    host: String,
}

impl SshExecutor {
    /// Open a TCP connection, handshake, and walk the authentication
    /// ladder: key file, agent signers, password.
    #[context("Connecting to {}@{}", config.user, config.host)]
    pub fn connect(config: &SshConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .with_context(|| format!("Dialling {}:{}", config.host, config.port))?;
        let mut session = ssh2::Session::new().context("Creating ssh session")?;
        session.set_tcp_stream(stream);
        session.handshake().context("ssh handshake")?;

        if let Some(key) = config.key_file.as_deref() {
            match session.userauth_pubkey_file(&config.user, None, key.as_std_path(), None) {
                Ok(()) => tracing::debug!("authenticated via key file {key}"),
                Err(e) => tracing::debug!("key file {key} rejected: {e}"),
            }
        }

        let mut agent = None;
        if !session.authenticated() && std::env::var_os("SSH_AUTH_SOCK").is_some() {
            match Self::try_agent(&session, &config.user) {
                Ok(a) => agent = a,
                Err(e) => tracing::debug!("agent authentication unavailable: {e}"),
            }
        }

        if !session.authenticated() {
            if let Some(password) = config.password.as_deref() {
                match session.userauth_password(&config.user, password) {
                    Ok(()) => tracing::debug!("authenticated via password"),
                    Err(e) => tracing::debug!("password rejected: {e}"),
                }
            }
        }

        if !session.authenticated() {
            return Err(ExecError::AuthenticationFailed {
                user: config.user.clone(),
                host: config.host.clone(),
            }
            .into());
        }
        Ok(Self {
            session,
            _agent: agent,
            host: config.host.clone(),
        })
    }

    fn try_agent(session: &ssh2::Session, user: &str) -> Result<Option<ssh2::Agent>> {
        let mut agent = session.agent().context("Opening key agent")?;
        agent.connect().context("Connecting to key agent")?;
        agent.list_identities().context("Listing agent identities")?;
        for identity in agent.identities()? {
            if agent.userauth(user, &identity).is_ok() && session.authenticated() {
                tracing::debug!("authenticated via agent signer {}", identity.comment());
                return Ok(Some(agent));
            }
        }
        Ok(Some(agent))
    }

    fn exec_raw(&self, cmd: &str, stdin: Option<&[u8]>) -> Result<(Vec<u8>, i32, String)> {
        tracing::trace!("ssh exec on {}: {cmd}", self.host);
        let mut channel = self
            .session
            .channel_session()
            .context("Opening ssh channel")?;
        channel.exec(cmd).with_context(|| format!("Executing `{cmd}`"))?;
        if let Some(input) = stdin {
            channel.write_all(input).context("Writing command stdin")?;
            channel.send_eof().context("Closing command stdin")?;
        }
        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .context("Reading command stdout")?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .context("Reading command stderr")?;
        channel.wait_close().context("Waiting for channel close")?;
        let status = channel.exit_status().context("Reading exit status")?;
        Ok((stdout, status, stderr.trim_end().to_string()))
    }

    fn exec_checked(&self, cmd: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let (stdout, status, stderr) = self.exec_raw(cmd, stdin)?;
        if status != 0 {
            let err = ExecError::CommandFailed { status, stderr };
            return Err(anyhow::Error::new(err)
                .context(format!("Running `{cmd}` on {}", self.host)));
        }
        Ok(stdout)
    }

    fn exec_string(&self, cmd: &str, stdin: Option<&[u8]>) -> Result<String> {
        let out = self.exec_checked(cmd, stdin)?;
        String::from_utf8(out).map_err(|_| ExecError::NonUtf8Output.into())
    }
}

/// Build the `cat` here-document that writes `text` to an already quoted
/// path. The terminator is quoted, so the payload is taken literally and
/// needs no escaping; single quotes only matter in the path itself.
fn heredoc_script(quoted_path: &str, text: &str) -> String {
    let mut script = format!("cat > {quoted_path} << '{HEREDOC_EOF}'\n");
    script.push_str(text);
    if !text.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(HEREDOC_EOF);
    script.push_str(&format!("\nchmod 0644 {quoted_path}"));
    script
}

/// Parse the `echo $!` trailer of a backgrounded command.
fn parse_background_pid(output: &str) -> Result<u32> {
    output
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Parsing background pid from {output:?}"))
}

/// What one socket-listing probe told us about a port.
enum ProbeOutcome {
    /// The probe ran and reported no listener.
    Free,
    /// The probe ran and reported a listener.
    Busy,
    /// The tool is missing or not permitted; try the next one.
    Unavailable,
}

/// `lsof` exits 1 with no output when nothing matches; that is a clean
/// "no listener" answer, not a probe failure.
fn classify_probe(result: &Result<String>) -> ProbeOutcome {
    match result {
        Ok(out) if out.trim().is_empty() => ProbeOutcome::Free,
        Ok(_) => ProbeOutcome::Busy,
        Err(e) => match e.chain().find_map(|c| c.downcast_ref::<ExecError>()) {
            Some(ExecError::CommandFailed { status: 1, stderr }) if stderr.is_empty() => {
                ProbeOutcome::Free
            }
            _ => ProbeOutcome::Unavailable,
        },
    }
}

impl Executor for SshExecutor {
    fn run(&self, cmd: &str) -> Result<String> {
        self.exec_string(cmd, None)
    }

    fn run_with_stdin(&self, cmd: &str, input: &[u8]) -> Result<String> {
        self.exec_string(cmd, Some(input))
    }

    fn start_background(&self, cmd: &str) -> Result<u32> {
        let out = self.run(&format!("nohup {cmd} > /dev/null 2>&1 & echo $!"))?;
        parse_background_pid(&out)
    }

    fn is_running(&self, pid: u32) -> Result<bool> {
        Ok(self.run(&format!("kill -0 {pid}")).is_ok())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.run(&format!("kill -9 {pid}")).map(|_| ())
    }

    fn signal_interrupt(&self, pid: u32) -> Result<()> {
        self.run(&format!("kill -INT {pid}")).map(|_| ())
    }

    fn mkdir(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        // chmod on a pre-existing directory is refused for system paths
        // like /tmp, so only newly created trees get the mode applied.
        if self.file_exists(path)? {
            return Ok(());
        }
        let p = shell_quote(path.as_str());
        self.run(&format!("mkdir -p {p} && chmod {mode:o} {p}"))
            .map(|_| ())
    }

    fn file_exists(&self, path: &Utf8Path) -> Result<bool> {
        let cmd = format!("test -e {}", shell_quote(path.as_str()));
        match self.exec_raw(&cmd, None)? {
            (_, 0, _) => Ok(true),
            (_, 1, _) => Ok(false),
            (_, status, stderr) => Err(ExecError::CommandFailed { status, stderr })
                .with_context(|| format!("Running `{cmd}` on {}", self.host)),
        }
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        self.run(&format!("rm -f {}", shell_quote(path.as_str())))
            .map(|_| ())
    }

    fn remove_tree(&self, path: &Utf8Path) -> Result<()> {
        self.run(&format!("rm -rf {}", shell_quote(path.as_str())))
            .map(|_| ())
    }

    #[context("Uploading {} bytes to {path}", content.len())]
    fn upload_content(&self, content: &[u8], path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir(parent, 0o755)?;
        }
        let quoted = shell_quote(path.as_str());
        match std::str::from_utf8(content) {
            // The here-document cannot carry its own terminator or raw
            // bytes; such payloads go through the stdin path below.
            Ok(text) if !text.contains(HEREDOC_EOF) => {
                self.run(&heredoc_script(&quoted, text))?;
            }
            _ => {
                self.run_with_stdin(&format!("cat > {quoted}"), content)?;
                self.run(&format!("chmod 0644 {quoted}"))?;
            }
        }
        Ok(())
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        // Raw channel bytes; nothing appends a trailing newline here.
        self.exec_checked(&format!("cat {}", shell_quote(path.as_str())), None)
    }

    #[context("Uploading {local} to {remote}")]
    fn upload_file(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<()> {
        let content = std::fs::read(local).with_context(|| format!("Reading {local}"))?;
        if let Some(parent) = remote.parent() {
            self.mkdir(parent, 0o755)?;
        }
        self.run_with_stdin(&format!("cat > {}", shell_quote(remote.as_str())), &content)?;
        Ok(())
    }

    #[context("Downloading {remote} to {local}")]
    fn download_file(&self, remote: &Utf8Path, local: &Utf8Path) -> Result<()> {
        let content = self.read_file(remote)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        std::fs::write(local, content).with_context(|| format!("Writing {local}"))?;
        Ok(())
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()> {
        self.run(&format!(
            "ln -sfn {} {}",
            shell_quote(target.as_str()),
            shell_quote(link.as_str())
        ))
        .map(|_| ())
    }

    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let out = self.run(&format!("readlink {}", shell_quote(path.as_str())))?;
        Ok(Utf8PathBuf::from(out.trim()))
    }

    fn canonicalize(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let out = self.run(&format!("readlink -f {}", shell_quote(path.as_str())))?;
        Ok(Utf8PathBuf::from(out.trim()))
    }

    #[context("Querying free space of {path}")]
    fn disk_available(&self, path: &Utf8Path) -> Result<u64> {
        let out = self.run(&format!(
            "df -B1 {} | tail -n1 | awk '{{print $4}}'",
            shell_quote(path.as_str())
        ))?;
        out.trim()
            .parse::<u64>()
            .with_context(|| format!("Parsing df output {out:?}"))
    }

    fn os_info(&self) -> Result<OsInfo> {
        let os = self.run("uname -s")?.trim().to_string();
        let machine = self.run("uname -m")?;
        let version = self.run("uname -r")?.trim().to_string();
        Ok(OsInfo {
            os,
            arch: canonicalize_arch(&machine),
            version,
        })
    }

    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run(&format!("id {}", shell_quote(name))).is_ok())
    }

    fn port_available(&self, port: u16) -> Result<bool> {
        let probes = [
            format!("sudo lsof -i :{port} -sTCP:LISTEN"),
            format!("lsof -i :{port} -sTCP:LISTEN"),
            format!("netstat -lnt | grep ':{port} '"),
        ];
        for probe in &probes {
            match classify_probe(&self.run(probe)) {
                ProbeOutcome::Free => return Ok(true),
                ProbeOutcome::Busy => return Ok(false),
                ProbeOutcome::Unavailable => continue,
            }
        }
        // No probe could run; nothing claims the port is taken.
        tracing::warn!("no socket-listing tool usable on {}; assuming port {port} free", self.host);
        Ok(true)
    }

    fn check_reachable(&self) -> Result<()> {
        let out = self.run("uname -s")?;
        anyhow::ensure!(!out.trim().is_empty(), "Empty reply from {}", self.host);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.session
            .disconnect(None, "mup closing session", None)
            .with_context(|| format!("Disconnecting from {}", self.host))?;
        Ok(())
    }
}

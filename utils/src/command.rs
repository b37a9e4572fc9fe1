//! Helpers intended for [`std::process::Command`].

use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Extension trait for [`std::process::Command`] that captures output
/// and turns non-zero exits into errors carrying the trailing stderr.
pub trait CommandRunExt {
    /// Execute the child process, discarding stdout.
    fn run(&mut self) -> Result<()>;
    /// Execute the child process, capturing stdout as a UTF-8 string.
    fn run_get_string(&mut self) -> Result<String>;
    /// Execute the child process, capturing raw stdout bytes.
    fn run_get_output(&mut self) -> Result<Vec<u8>>;
}

/// Keep at most this much stderr for error messages.
const MAX_STDERR_BYTES: usize = 4096;

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim_end().to_string()
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let _ = self.run_get_output()?;
        Ok(())
    }
    fn run_get_string(&mut self) -> Result<String> {
        let out = self.run_get_output()?;
        String::from_utf8(out).map_err(|_| anyhow::anyhow!("Command output was not UTF-8"))
    }
    fn run_get_output(&mut self) -> Result<Vec<u8>> {
        tracing::trace!("exec: {self:?}");
        self.stdin(Stdio::null());
        let output = self
            .output()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if !output.status.success() {
            anyhow::bail!(
                "Command {:?} failed: {}: {}",
                self.get_program(),
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        Command::new("true").run().unwrap();
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = format!("{e}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("sh")
            .args(["-c", "printf hello"])
            .run_get_string()
            .unwrap();
        assert_eq!(s, "hello");
    }
}

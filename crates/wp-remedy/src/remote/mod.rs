//! Remote shell capability consumed by backups, evidence collection and
//! playbooks.
//!
//! The engine never talks to a transport directly; it opens a [`Session`]
//! over a [`RemoteChannel`], which acquires one handle for the lifetime of a
//! logical operation and releases it on drop.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::ServerRecord;

pub mod local;
pub mod process;
pub mod ssh;

pub use local::LocalChannel;
pub use ssh::SshChannel;

/// Exit status reported for commands killed at their deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    pub id: String,
    pub server_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stderr if present, else stdout, else the exit status.
    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        if self.timed_out {
            return format!("timed out after {}ms", self.duration.as_millis());
        }
        format!("exit status {}", self.exit_code)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub success: bool,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

impl TransferResult {
    pub fn ok(bytes: u64) -> Self {
        Self {
            success: true,
            bytes_transferred: bytes,
            error: None,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            bytes_transferred: 0,
            error: Some(msg.into()),
        }
    }
}

pub trait RemoteChannel: Send + Sync {
    fn connect(&self, server: &ServerRecord) -> Result<RemoteHandle>;

    /// Runs a shell command. A command that exceeds `opts.timeout` is reported
    /// as a failed output with [`TIMEOUT_EXIT_CODE`], never as an `Err`.
    fn execute(
        &self,
        handle: &RemoteHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<CommandOutput>;

    fn download_file(&self, handle: &RemoteHandle, remote: &str, local: &Path)
    -> Result<TransferResult>;

    fn upload_file(&self, handle: &RemoteHandle, local: &Path, remote: &str)
    -> Result<TransferResult>;

    fn disconnect(&self, handle: &RemoteHandle);
}

/// File facts gathered before a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub is_dir: bool,
}

const MISSING_MARKER: &str = "__WP_REMEDY_MISSING__";

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn parse_stat_line(line: &str) -> Result<RemoteStat> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 5 {
        return Err(Error::Remote(format!("unexpected stat output: '{}'", line.trim())));
    }
    let size = parts[0]
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::Remote(format!("unexpected stat size '{}': {e}", parts[0])))?;
    Ok(RemoteStat {
        size,
        permissions: parts[1].trim().to_string(),
        owner: parts[2].trim().to_string(),
        group: parts[3].trim().to_string(),
        is_dir: parts[4].trim() == "directory",
    })
}

/// One acquired connection. Dropping it disconnects.
pub struct Session<'a> {
    channel: &'a dyn RemoteChannel,
    handle: RemoteHandle,
    timeout: Duration,
}

impl<'a> Session<'a> {
    pub fn open(
        channel: &'a dyn RemoteChannel,
        server: &ServerRecord,
        timeout: Duration,
    ) -> Result<Self> {
        let handle = channel.connect(server)?;
        debug!(server_id = %server.id, handle = %handle.id, "remote session opened");
        Ok(Self {
            channel,
            handle,
            timeout,
        })
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }

    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, self.timeout)
    }

    pub fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let out = self
            .channel
            .execute(&self.handle, command, &ExecOptions::with_timeout(timeout))?;
        if out.timed_out {
            warn!(handle = %self.handle.id, timeout_ms = timeout.as_millis() as u64, "remote command timed out");
        }
        Ok(out)
    }

    /// Runs a command and returns trimmed stdout, or an error carrying the
    /// command summary when it fails.
    pub fn exec_ok(&self, command: &str) -> Result<String> {
        let out = self.exec(command)?;
        if out.success() {
            return Ok(out.stdout.trim().to_string());
        }
        Err(Error::Remote(format!(
            "command failed ({}): {}",
            out.exit_code,
            out.summary()
        )))
    }

    pub fn download(&self, remote: &str, local: &Path) -> Result<TransferResult> {
        self.channel.download_file(&self.handle, remote, local)
    }

    pub fn upload(&self, local: &Path, remote: &str) -> Result<TransferResult> {
        self.channel.upload_file(&self.handle, local, remote)
    }

    pub fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        let q = sh_quote(path);
        let out = self.exec(&format!(
            "if [ -e {q} ]; then stat -c '%s|%a|%U|%G|%F' {q}; else echo {MISSING_MARKER}; fi"
        ))?;
        if !out.success() {
            return Err(Error::Remote(format!(
                "stat {} failed: {}",
                path,
                out.summary()
            )));
        }
        let line = out.stdout.trim();
        if line == MISSING_MARKER {
            return Ok(None);
        }
        parse_stat_line(line).map(Some)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let out = self.exec(&format!("test -e {}", sh_quote(path)))?;
        Ok(out.success())
    }

    /// Recursive size in bytes of a remote directory.
    pub fn dir_size(&self, path: &str) -> Result<u64> {
        let raw = self.exec_ok(&format!("du -sb {} | cut -f1", sh_quote(path)))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| Error::Remote(format!("unexpected du output '{}': {e}", raw.trim())))
    }

    pub fn read_file(&self, path: &str) -> Result<String> {
        let out = self.exec(&format!("cat {}", sh_quote(path)))?;
        if !out.success() {
            return Err(Error::Remote(format!(
                "failed to read {}: {}",
                path,
                out.summary()
            )));
        }
        Ok(out.stdout)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.exec_ok(&format!("rm -rf {}", sh_quote(path)))?;
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.channel.disconnect(&self.handle);
        debug!(handle = %self.handle.id, "remote session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote("/var/www/html"), "'/var/www/html'");
    }

    #[test]
    fn parse_stat_line_reads_all_fields() {
        let st = parse_stat_line("1024|644|www-data|www-data|regular file\n").expect("parse");
        assert_eq!(st.size, 1024);
        assert_eq!(st.permissions, "644");
        assert_eq!(st.owner, "www-data");
        assert!(!st.is_dir);
        assert!(parse_stat_line("garbage").is_err());
    }

    #[test]
    fn summary_prefers_stderr() {
        let out = CommandOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 1,
            ..Default::default()
        };
        assert_eq!(out.summary(), "err");
        let timed = CommandOutput {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            duration: Duration::from_millis(5),
            ..Default::default()
        };
        assert!(!timed.success());
        assert!(timed.summary().contains("timed out"));
    }
}

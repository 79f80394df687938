use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::remote::process::run_with_timeout;
use crate::remote::{CommandOutput, ExecOptions, RemoteChannel, RemoteHandle, TransferResult};
use crate::store::ServerRecord;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SshServerConfig {
    // "user@host"
    pub target: String,
    pub target_env: Option<String>,
    pub port: Option<u16>,
    pub port_env: Option<String>,
    pub identity_file: Option<String>,
    pub identity_file_env: Option<String>,
    pub known_hosts_file: Option<String>,
    pub known_hosts_file_env: Option<String>,
    pub strict_host_key_checking: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
struct SshResolved {
    host: String,
    port: Option<u16>,
    identity_file: Option<String>,
    known_hosts_file: Option<String>,
    strict_host_key_checking: Option<bool>,
    connect_timeout_secs: u64,
    control_path: PathBuf,
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    let key = env_key.map(str::trim).filter(|s| !s.is_empty())?;
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| resolve_env_ref(env_key))
}

/// Turns config plus server record into concrete ssh arguments. Config for the
/// server id wins; otherwise the record's hostname/user/port are used.
fn resolve_ssh(
    server: &ServerRecord,
    cfg: Option<&SshServerConfig>,
    control_path: PathBuf,
) -> Result<SshResolved> {
    let empty = SshServerConfig::default();
    let cfg = cfg.unwrap_or(&empty);

    let host = resolve_string_field(Some(cfg.target.as_str()), cfg.target_env.as_deref())
        .or_else(|| {
            let h = server.hostname.trim();
            if h.is_empty() {
                return None;
            }
            Some(match server.ssh_user.as_deref().map(str::trim) {
                Some(u) if !u.is_empty() => format!("{u}@{h}"),
                _ => h.to_string(),
            })
        })
        .ok_or_else(|| {
            Error::Config(format!(
                "servers.{}: no ssh target configured and server record has no hostname",
                server.id
            ))
        })?;

    let port = match cfg.port.or(server.ssh_port) {
        Some(v) => Some(v),
        None => resolve_env_ref(cfg.port_env.as_deref())
            .map(|s| {
                s.parse::<u16>().map_err(|e| {
                    Error::Config(format!("servers.{}.port_env parse failed: {e}", server.id))
                })
            })
            .transpose()?,
    };

    Ok(SshResolved {
        host,
        port,
        identity_file: resolve_string_field(
            cfg.identity_file.as_deref(),
            cfg.identity_file_env.as_deref(),
        ),
        known_hosts_file: resolve_string_field(
            cfg.known_hosts_file.as_deref(),
            cfg.known_hosts_file_env.as_deref(),
        ),
        strict_host_key_checking: cfg.strict_host_key_checking,
        connect_timeout_secs: cfg.connect_timeout_secs.unwrap_or(10),
        control_path,
    })
}

fn configure_ssh_cmd(cmd: &mut Command, ssh: &SshResolved, scp_style: bool) {
    if let Some(port) = ssh.port {
        cmd.arg(if scp_style { "-P" } else { "-p" })
            .arg(port.to_string());
    }
    if let Some(id) = ssh.identity_file.as_deref() {
        cmd.arg("-i").arg(id);
    }
    if let Some(kh) = ssh.known_hosts_file.as_deref() {
        cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
    }
    if matches!(ssh.strict_host_key_checking, Some(false)) {
        cmd.arg("-o").arg("StrictHostKeyChecking=no");
        if ssh.known_hosts_file.is_none() {
            cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
        }
    }
    cmd.arg("-o").arg("BatchMode=yes");
    cmd.arg("-o")
        .arg(format!("ConnectTimeout={}", ssh.connect_timeout_secs));
    cmd.arg("-o")
        .arg(format!("ControlPath={}", ssh.control_path.display()));
}

/// OpenSSH transport. Each handle owns a ControlMaster socket so every command
/// and transfer within one operation reuses a single authenticated connection.
pub struct SshChannel {
    servers: BTreeMap<String, SshServerConfig>,
    control_dir: PathBuf,
    transfer_timeout: Duration,
    sessions: Mutex<BTreeMap<String, SshResolved>>,
}

impl SshChannel {
    pub fn new(
        servers: BTreeMap<String, SshServerConfig>,
        control_dir: impl Into<PathBuf>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            servers,
            control_dir: control_dir.into(),
            transfer_timeout,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn session(&self, handle: &RemoteHandle) -> Result<SshResolved> {
        self.sessions
            .lock()
            .map_err(|_| Error::msg("ssh session table poisoned"))?
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("unknown or closed ssh handle '{}'", handle.id)))
    }

    fn scp(&self, ssh: &SshResolved, from: &str, to: &str) -> Result<CommandOutput> {
        let mut cmd = Command::new("scp");
        configure_ssh_cmd(&mut cmd, ssh, true);
        cmd.arg("-q").arg(from).arg(to);
        run_with_timeout(cmd, self.transfer_timeout)
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

impl RemoteChannel for SshChannel {
    fn connect(&self, server: &ServerRecord) -> Result<RemoteHandle> {
        fs::create_dir_all(&self.control_dir).map_err(|e| {
            Error::Storage(format!(
                "failed to create {}: {e}",
                self.control_dir.display()
            ))
        })?;
        let id = short_id();
        // Unix socket paths are length-limited; keep the name short.
        let control_path = self.control_dir.join(format!("cm-{id}"));
        let ssh = resolve_ssh(server, self.servers.get(&server.id), control_path)?;

        let mut master = Command::new("ssh");
        configure_ssh_cmd(&mut master, &ssh, false);
        master
            .arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-o")
            .arg("ControlPersist=300")
            .arg(&ssh.host);
        let out = run_with_timeout(master, Duration::from_secs(ssh.connect_timeout_secs + 5))?;
        if !out.success() {
            return Err(Error::Remote(format!(
                "ssh connect to {} ({}) failed: {}",
                server.id,
                ssh.host,
                out.summary()
            )));
        }

        info!(server_id = %server.id, host = %ssh.host, handle = %id, "ssh master connected");
        self.sessions
            .lock()
            .map_err(|_| Error::msg("ssh session table poisoned"))?
            .insert(id.clone(), ssh);
        Ok(RemoteHandle {
            id,
            server_id: server.id.clone(),
        })
    }

    fn execute(
        &self,
        handle: &RemoteHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<CommandOutput> {
        let ssh = self.session(handle)?;
        let mut cmd = Command::new("ssh");
        configure_ssh_cmd(&mut cmd, &ssh, false);
        cmd.arg(&ssh.host).arg(command);
        run_with_timeout(cmd, opts.timeout)
    }

    fn download_file(
        &self,
        handle: &RemoteHandle,
        remote: &str,
        local: &Path,
    ) -> Result<TransferResult> {
        let ssh = self.session(handle)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("failed to create {}: {e}", parent.display())))?;
        }
        let out = self.scp(
            &ssh,
            &format!("{}:{remote}", ssh.host),
            &local.to_string_lossy(),
        )?;
        if !out.success() {
            return Ok(TransferResult::failed(out.summary()));
        }
        let bytes = fs::metadata(local).map(|m| m.len()).unwrap_or(0);
        debug!(handle = %handle.id, remote, bytes, "downloaded");
        Ok(TransferResult::ok(bytes))
    }

    fn upload_file(
        &self,
        handle: &RemoteHandle,
        local: &Path,
        remote: &str,
    ) -> Result<TransferResult> {
        let ssh = self.session(handle)?;
        let bytes = fs::metadata(local)
            .map_err(|e| Error::Storage(format!("failed to stat {}: {e}", local.display())))?
            .len();
        let out = self.scp(
            &ssh,
            &local.to_string_lossy(),
            &format!("{}:{remote}", ssh.host),
        )?;
        if !out.success() {
            return Ok(TransferResult::failed(out.summary()));
        }
        debug!(handle = %handle.id, remote, bytes, "uploaded");
        Ok(TransferResult::ok(bytes))
    }

    fn disconnect(&self, handle: &RemoteHandle) {
        let removed = match self.sessions.lock() {
            Ok(mut g) => g.remove(&handle.id),
            Err(_) => None,
        };
        let Some(ssh) = removed else {
            return;
        };
        let mut cmd = Command::new("ssh");
        configure_ssh_cmd(&mut cmd, &ssh, false);
        cmd.arg("-O").arg("exit").arg(&ssh.host);
        match run_with_timeout(cmd, Duration::from_secs(5)) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(handle = %handle.id, "ssh master exit failed: {}", out.summary()),
            Err(e) => warn!(handle = %handle.id, "ssh master exit failed: {e}"),
        }
        let _ = fs::remove_file(&ssh.control_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_config_and_env_fields() {
        unsafe {
            std::env::set_var("WP_REMEDY_TEST_SSH_TARGET", "deploy@web1");
            std::env::set_var("WP_REMEDY_TEST_SSH_PORT", "2222");
            std::env::set_var("WP_REMEDY_TEST_SSH_KEY", "/tmp/key");
        }
        let cfg = SshServerConfig {
            target_env: Some("WP_REMEDY_TEST_SSH_TARGET".into()),
            port_env: Some("WP_REMEDY_TEST_SSH_PORT".into()),
            identity_file_env: Some("WP_REMEDY_TEST_SSH_KEY".into()),
            strict_host_key_checking: Some(false),
            ..Default::default()
        };
        let server = ServerRecord::new("web1", "ignored.example.com");
        let resolved = resolve_ssh(&server, Some(&cfg), PathBuf::from("/tmp/cm-x")).expect("resolve");
        assert_eq!(resolved.host, "deploy@web1");
        assert_eq!(resolved.port, Some(2222));
        assert_eq!(resolved.identity_file.as_deref(), Some("/tmp/key"));
        assert_eq!(resolved.strict_host_key_checking, Some(false));
    }

    #[test]
    fn resolve_falls_back_to_server_record() {
        let mut server = ServerRecord::new("web2", "web2.example.com");
        server.ssh_user = Some("root".into());
        server.ssh_port = Some(22);
        let resolved = resolve_ssh(&server, None, PathBuf::from("/tmp/cm-y")).expect("resolve");
        assert_eq!(resolved.host, "root@web2.example.com");
        assert_eq!(resolved.port, Some(22));
    }

    #[test]
    fn resolve_without_any_target_is_an_error() {
        let server = ServerRecord::new("web3", "  ");
        assert!(resolve_ssh(&server, None, PathBuf::from("/tmp/cm-z")).is_err());
    }

    #[test]
    fn configure_uses_scp_port_flag() {
        let ssh = SshResolved {
            host: "h".into(),
            port: Some(2200),
            identity_file: None,
            known_hosts_file: None,
            strict_host_key_checking: None,
            connect_timeout_secs: 10,
            control_path: PathBuf::from("/tmp/cm"),
        };
        let mut cmd = Command::new("scp");
        configure_ssh_cmd(&mut cmd, &ssh, true);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-P");
        assert_eq!(args[1], "2200");
        assert!(args.iter().any(|a| a == "ControlPath=/tmp/cm"));
    }
}

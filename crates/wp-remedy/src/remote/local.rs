use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::remote::process::run_with_timeout;
use crate::remote::{CommandOutput, ExecOptions, RemoteChannel, RemoteHandle, TransferResult};
use crate::store::ServerRecord;

/// Transport for sites hosted on the engine's own machine: commands run under
/// `sh -c` and "remote" paths are local paths.
#[derive(Debug, Default)]
pub struct LocalChannel {
    next_handle: AtomicU64,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

fn copy_file(from: &Path, to: &Path) -> TransferResult {
    if let Some(parent) = to.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            return TransferResult::failed(format!("failed to create {}: {e}", parent.display()));
        }
    }
    match fs::copy(from, to) {
        Ok(n) => TransferResult::ok(n),
        Err(e) => TransferResult::failed(format!(
            "failed to copy {} -> {}: {e}",
            from.display(),
            to.display()
        )),
    }
}

impl RemoteChannel for LocalChannel {
    fn connect(&self, server: &ServerRecord) -> Result<RemoteHandle> {
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(RemoteHandle {
            id: format!("local-{n}"),
            server_id: server.id.clone(),
        })
    }

    fn execute(
        &self,
        _handle: &RemoteHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_with_timeout(cmd, opts.timeout)
    }

    fn download_file(
        &self,
        _handle: &RemoteHandle,
        remote: &str,
        local: &Path,
    ) -> Result<TransferResult> {
        Ok(copy_file(Path::new(remote), local))
    }

    fn upload_file(
        &self,
        _handle: &RemoteHandle,
        local: &Path,
        remote: &str,
    ) -> Result<TransferResult> {
        Ok(copy_file(local, Path::new(remote)))
    }

    fn disconnect(&self, _handle: &RemoteHandle) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::remote::Session;

    fn server() -> ServerRecord {
        ServerRecord::new("local", "localhost")
    }

    #[test]
    fn session_stat_reports_missing_and_present_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("wp-config.php");
        fs::write(&file, "<?php // config").expect("write");

        let ch = LocalChannel::new();
        let s = Session::open(&ch, &server(), Duration::from_secs(5)).expect("open");
        let st = s
            .stat(file.to_str().expect("utf8"))
            .expect("stat")
            .expect("exists");
        assert_eq!(st.size, 15);
        assert!(!st.is_dir);

        let missing = tmp.path().join("nope");
        assert!(s.stat(missing.to_str().expect("utf8")).expect("stat").is_none());
    }

    #[test]
    fn transfers_copy_bytes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("a.txt");
        fs::write(&src, "abc").expect("write");
        let ch = LocalChannel::new();
        let h = ch.connect(&server()).expect("connect");
        let dst = tmp.path().join("nested").join("b.txt");
        let res = ch
            .download_file(&h, src.to_str().expect("utf8"), &dst)
            .expect("download");
        assert!(res.success);
        assert_eq!(res.bytes_transferred, 3);

        let bad = ch
            .download_file(&h, "/definitely/not/here", &tmp.path().join("c"))
            .expect("download");
        assert!(!bad.success);
        assert!(bad.error.is_some());
    }
}

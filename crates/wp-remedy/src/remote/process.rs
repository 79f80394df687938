use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::remote::{CommandOutput, TIMEOUT_EXIT_CODE};

fn read_all(mut r: impl Read + Send + 'static) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

/// Runs a local process (a shell, ssh, scp) with a hard deadline. On timeout
/// the whole process group is killed and a synthetic failed output returned.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let started = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Remote(format!("failed to spawn {:?}: {e}", cmd)))?;
    let pid = child.id();

    let stdout_rx = child.stdout.take().map(read_all);
    let stderr_rx = child.stderr.take().map(read_all);

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    kill_pgroup(pid);
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(Error::Remote(format!("wait failed: {e}"))),
        }
    };

    // Readers finish once the pipes close; bound the wait in case a grandchild
    // kept them open.
    let collect = |rx: Option<mpsc::Receiver<Vec<u8>>>| -> String {
        rx.and_then(|rx| rx.recv_timeout(Duration::from_secs(1)).ok())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    };
    let stdout = collect(stdout_rx);
    let stderr = collect(stderr_rx);

    let exit_code = match status {
        Some(s) => s.code().unwrap_or(-1),
        None => TIMEOUT_EXIT_CODE,
    };

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        duration: started.elapsed(),
        timed_out,
    })
}

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use wp_remedy::Result;
use wp_remedy::audit::RecordingAuditLog;
use wp_remedy::backup::{BackupManager, BackupSettings};
use wp_remedy::evidence::{EvidenceRecorder, EvidenceSettings};
use wp_remedy::playbooks::PlaybookDeps;
use wp_remedy::probe::{ProbeResult, SiteProbe};
use wp_remedy::redact::PatternRedactor;
use wp_remedy::remote::{
    CommandOutput, ExecOptions, LocalChannel, RemoteChannel, RemoteHandle, TransferResult,
};
use wp_remedy::store::{ArtifactStore, IncidentRecord, MemoryStore, ServerRecord};

pub const INCIDENT: &str = "inc-1";
pub const SERVER: &str = "srv-1";

type Rewrite = Box<dyn Fn(&str) -> String + Send + Sync>;

enum Action {
    Output(CommandOutput),
    /// Runs a different shell command in place of the original.
    Rewrite(Rewrite),
}

struct Rule {
    needle: String,
    action: Action,
    remaining: Option<usize>,
}

/// Local-host transport with canned answers for commands that need tools
/// the test machine lacks (`wp`, `mysqladmin`, `systemctl`). Every call is
/// recorded in order.
#[derive(Default)]
pub struct ScriptedChannel {
    inner: LocalChannel,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

fn canned(stdout: &str, exit_code: i32) -> Action {
    Action::Output(CommandOutput {
        stdout: stdout.to_string(),
        exit_code,
        ..Default::default()
    })
}

impl ScriptedChannel {
    fn push(&self, needle: &str, action: Action, remaining: Option<usize>) {
        self.rules.lock().expect("rules lock").push(Rule {
            needle: needle.to_string(),
            action,
            remaining,
        });
    }

    /// Commands containing `needle` answer with `stdout` and `exit_code`
    /// instead of running. Later rules win.
    pub fn respond(&self, needle: &str, stdout: &str, exit_code: i32) {
        self.push(needle, canned(stdout, exit_code), None);
    }

    /// Like [`respond`](Self::respond) but only for the next `times` matches.
    pub fn respond_times(&self, needle: &str, stdout: &str, exit_code: i32, times: usize) {
        self.push(needle, canned(stdout, exit_code), Some(times));
    }

    pub fn rewrite(&self, needle: &str, f: impl Fn(&str) -> String + Send + Sync + 'static) {
        self.push(needle, Action::Rewrite(Box::new(f)), None);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Index of the first recorded call containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn scripted(&self, command: &str) -> Option<std::result::Result<CommandOutput, String>> {
        let mut rules = self.rules.lock().expect("rules lock");
        let idx = rules.iter().rposition(|r| command.contains(&r.needle))?;
        let rule = &mut rules[idx];
        let answer = match &rule.action {
            Action::Output(out) => Ok(out.clone()),
            Action::Rewrite(f) => Err(f(command)),
        };
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
            if *n == 0 {
                rules.remove(idx);
            }
        }
        Some(answer)
    }
}

impl RemoteChannel for ScriptedChannel {
    fn connect(&self, server: &ServerRecord) -> Result<RemoteHandle> {
        self.inner.connect(server)
    }

    fn execute(&self, handle: &RemoteHandle, command: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        self.record(format!("exec: {command}"));
        match self.scripted(command) {
            Some(Ok(out)) => Ok(out),
            Some(Err(replacement)) => self.inner.execute(handle, &replacement, opts),
            None => self.inner.execute(handle, command, opts),
        }
    }

    fn download_file(&self, handle: &RemoteHandle, remote: &str, local: &Path) -> Result<TransferResult> {
        self.record(format!("download: {remote}"));
        self.inner.download_file(handle, remote, local)
    }

    fn upload_file(&self, handle: &RemoteHandle, local: &Path, remote: &str) -> Result<TransferResult> {
        self.record(format!("upload: {remote}"));
        self.inner.upload_file(handle, local, remote)
    }

    fn disconnect(&self, handle: &RemoteHandle) {
        self.inner.disconnect(handle);
    }
}

pub struct StaticProbe {
    pub healthy: bool,
}

impl SiteProbe for StaticProbe {
    fn check(&self, url: &str) -> ProbeResult {
        ProbeResult {
            url: url.to_string(),
            reachable: self.healthy,
            status: Some(if self.healthy { 200 } else { 500 }),
            response_time_ms: 1,
            failure_marker: None,
            error: None,
        }
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub store: Arc<MemoryStore>,
    pub channel: Arc<ScriptedChannel>,
    pub audit: Arc<RecordingAuditLog>,
    pub backups: Arc<BackupManager>,
    pub evidence: Arc<EvidenceRecorder>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_evidence_settings(EvidenceSettings::default())
    }

    pub fn with_evidence_settings(evidence_settings: EvidenceSettings) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let remote_tmp = tmp.path().join("remote-tmp");
        fs::create_dir_all(&remote_tmp).expect("remote tmp dir");
        fs::create_dir_all(tmp.path().join("site")).expect("site dir");

        let store = Arc::new(MemoryStore::new());
        store
            .save_server(&ServerRecord::new(SERVER, "localhost"))
            .expect("save server");
        let mut incident = IncidentRecord::new(INCIDENT, "site-1", SERVER);
        incident.domain = Some("example.test".into());
        store.save_incident(&incident).expect("save incident");

        let channel = Arc::new(ScriptedChannel::default());
        let audit = Arc::new(RecordingAuditLog::new());

        let mut settings = BackupSettings::with_local_dir(tmp.path().join("backups"));
        settings.remote_temp_dir = remote_tmp.to_string_lossy().into_owned();
        settings.command_timeout = Duration::from_secs(10);

        let backups = Arc::new(BackupManager::new(
            store.clone(),
            channel.clone(),
            audit.clone(),
            settings,
        ));
        let evidence = Arc::new(EvidenceRecorder::new(
            store.clone(),
            channel.clone(),
            audit.clone(),
            Arc::new(PatternRedactor::new()),
            evidence_settings,
        ));
        Self {
            tmp,
            store,
            channel,
            audit,
            backups,
            evidence,
        }
    }

    pub fn site_dir(&self) -> PathBuf {
        self.tmp.path().join("site")
    }

    pub fn site_path(&self, rel: &str) -> String {
        self.site_dir().join(rel).to_string_lossy().into_owned()
    }

    /// Writes a file under the site dir and returns its absolute path.
    pub fn write(&self, rel: &str, content: &str) -> String {
        let path = self.site_dir().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(&path, content).expect("write site file");
        path.to_string_lossy().into_owned()
    }

    pub fn deps(&self, healthy_site: bool) -> Arc<PlaybookDeps> {
        Arc::new(PlaybookDeps {
            store: self.store.clone(),
            channel: self.channel.clone(),
            backups: self.backups.clone(),
            evidence: self.evidence.clone(),
            probe: Arc::new(StaticProbe {
                healthy: healthy_site,
            }),
            command_timeout: Duration::from_secs(10),
            probe_scheme: "https".into(),
        })
    }
}

pub fn set_mode(path: &str, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
}

pub fn mode_of(path: &str) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

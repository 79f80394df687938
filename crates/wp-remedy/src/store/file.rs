use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backup::BackupArtifact;
use crate::error::{Error, Result};
use crate::evidence::EvidenceRecord;
use crate::store::{ArtifactStore, IncidentRecord, ServerRecord};

const BACKUPS: &str = "backups/records";
const EVIDENCE: &str = "evidence";
const INCIDENTS: &str = "incidents";
const SERVERS: &str = "servers";

/// One pretty-printed JSON document per record, grouped by kind under a root
/// directory. Writes are atomic (temp file + rename) and serialized through a
/// lock file so several engine processes can share one root.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn safe_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::Storage("record id is empty".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        || id.starts_with('.')
    {
        return Err(Error::Storage(format!(
            "record id '{id}' contains unsupported characters"
        )));
    }
    Ok(id)
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Storage(format!("invalid record path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::Storage(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Storage(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

impl JsonFileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [BACKUPS, EVIDENCE, INCIDENTS, SERVERS] {
            let dir = root.join(kind);
            fs::create_dir_all(&dir)
                .map_err(|e| Error::Storage(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(kind).join(format!("{}.json", safe_id(id)?)))
    }

    fn lock(&self) -> Result<StoreLock> {
        let path = self.root.join(".store.lock");
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(StoreLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::Storage(format!(
                            "timed out waiting for store lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "failed to acquire store lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn put<T: Serialize>(&self, kind: &str, id: &str, v: &T, create_only: bool) -> Result<()> {
        let path = self.record_path(kind, id)?;
        let body = serde_json::to_string_pretty(v)?;
        let _lock = self.lock()?;
        if create_only && path.exists() {
            return Err(Error::Storage(format!("record {kind}/{id} already exists")));
        }
        atomic_write_text(&path, &body)
    }

    fn get<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        let path = self.record_path(kind, id)?;
        read_record(&path)
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool> {
        let path = self.record_path(kind, id)?;
        let _lock = self.lock()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    fn scan<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Storage(format!("walkdir error: {e}")))?;
            let name = entry.file_name().to_string_lossy();
            if !entry.file_type().is_file() || name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if let Some(v) = read_record(entry.path())? {
                out.push(v);
            }
        }
        Ok(out)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::Storage(format!("failed to parse {}: {e}", path.display())))
}

impl ArtifactStore for JsonFileStore {
    fn save_incident(&self, incident: &IncidentRecord) -> Result<()> {
        self.put(INCIDENTS, &incident.id, incident, false)
    }

    fn find_incident(&self, id: &str) -> Result<Option<IncidentRecord>> {
        self.get(INCIDENTS, id)
    }

    fn save_server(&self, server: &ServerRecord) -> Result<()> {
        self.put(SERVERS, &server.id, server, false)
    }

    fn find_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        self.get(SERVERS, id)
    }

    fn create_backup(&self, artifact: &BackupArtifact) -> Result<()> {
        self.put(BACKUPS, &artifact.id, artifact, true)
    }

    fn find_backup(&self, id: &str) -> Result<Option<BackupArtifact>> {
        self.get(BACKUPS, id)
    }

    fn delete_backup(&self, id: &str) -> Result<bool> {
        self.remove(BACKUPS, id)
    }

    fn list_backups(&self, incident_id: &str) -> Result<Vec<BackupArtifact>> {
        Ok(self
            .scan::<BackupArtifact>(BACKUPS)?
            .into_iter()
            .filter(|a| a.incident_id == incident_id)
            .collect())
    }

    fn create_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        self.put(EVIDENCE, &record.id, record, true)
    }

    fn find_evidence(&self, id: &str) -> Result<Option<EvidenceRecord>> {
        self.get(EVIDENCE, id)
    }

    fn delete_evidence(&self, id: &str) -> Result<bool> {
        self.remove(EVIDENCE, id)
    }

    fn list_evidence(&self, incident_id: Option<&str>) -> Result<Vec<EvidenceRecord>> {
        Ok(self
            .scan::<EvidenceRecord>(EVIDENCE)?
            .into_iter()
            .filter(|r| incident_id.is_none_or(|id| r.incident_id == id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_and_server_round_trip_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(tmp.path()).expect("open");
        store
            .save_incident(&IncidentRecord::new("inc-1", "site-1", "srv-1"))
            .expect("save incident");
        store
            .save_server(&ServerRecord::new("srv-1", "web1.example.com"))
            .expect("save server");

        let reopened = JsonFileStore::open(tmp.path()).expect("reopen");
        let inc = reopened.find_incident("inc-1").expect("find").expect("some");
        assert_eq!(inc.server_id, "srv-1");
        assert!(reopened.find_server("srv-2").expect("find").is_none());
        assert!(!tmp.path().join(".store.lock").exists());
    }

    #[test]
    fn rejects_path_like_ids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(tmp.path()).expect("open");
        assert!(store.find_incident("../etc/passwd").is_err());
        assert!(store.find_incident("").is_err());
    }

    #[test]
    fn delete_missing_record_reports_false() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(tmp.path()).expect("open");
        assert!(!store.delete_backup("nope").expect("delete"));
    }
}

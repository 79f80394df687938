use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::backup::BackupArtifact;
use crate::error::{Error, Result};
use crate::evidence::EvidenceRecord;
use crate::store::{ArtifactStore, IncidentRecord, ServerRecord};

#[derive(Default)]
struct Tables {
    incidents: BTreeMap<String, IncidentRecord>,
    servers: BTreeMap<String, ServerRecord>,
    backups: BTreeMap<String, BackupArtifact>,
    evidence: BTreeMap<String, EvidenceRecord>,
}

/// Process-local store. Used for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let g = self
            .tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(f(&g))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut g = self
            .tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(f(&mut g))
    }
}

impl ArtifactStore for MemoryStore {
    fn save_incident(&self, incident: &IncidentRecord) -> Result<()> {
        self.write(|t| {
            t.incidents.insert(incident.id.clone(), incident.clone());
        })
    }

    fn find_incident(&self, id: &str) -> Result<Option<IncidentRecord>> {
        self.read(|t| t.incidents.get(id).cloned())
    }

    fn save_server(&self, server: &ServerRecord) -> Result<()> {
        self.write(|t| {
            t.servers.insert(server.id.clone(), server.clone());
        })
    }

    fn find_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        self.read(|t| t.servers.get(id).cloned())
    }

    fn create_backup(&self, artifact: &BackupArtifact) -> Result<()> {
        self.write(|t| {
            if t.backups.contains_key(&artifact.id) {
                return Err(Error::Storage(format!(
                    "backup artifact {} already exists",
                    artifact.id
                )));
            }
            t.backups.insert(artifact.id.clone(), artifact.clone());
            Ok(())
        })?
    }

    fn find_backup(&self, id: &str) -> Result<Option<BackupArtifact>> {
        self.read(|t| t.backups.get(id).cloned())
    }

    fn delete_backup(&self, id: &str) -> Result<bool> {
        self.write(|t| t.backups.remove(id).is_some())
    }

    fn list_backups(&self, incident_id: &str) -> Result<Vec<BackupArtifact>> {
        self.read(|t| {
            t.backups
                .values()
                .filter(|a| a.incident_id == incident_id)
                .cloned()
                .collect()
        })
    }

    fn create_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        self.write(|t| {
            if t.evidence.contains_key(&record.id) {
                return Err(Error::Storage(format!(
                    "evidence record {} already exists",
                    record.id
                )));
            }
            t.evidence.insert(record.id.clone(), record.clone());
            Ok(())
        })?
    }

    fn find_evidence(&self, id: &str) -> Result<Option<EvidenceRecord>> {
        self.read(|t| t.evidence.get(id).cloned())
    }

    fn delete_evidence(&self, id: &str) -> Result<bool> {
        self.write(|t| t.evidence.remove(id).is_some())
    }

    fn list_evidence(&self, incident_id: Option<&str>) -> Result<Vec<EvidenceRecord>> {
        self.read(|t| {
            t.evidence
                .values()
                .filter(|r| incident_id.is_none_or(|id| r.incident_id == id))
                .cloned()
                .collect()
        })
    }
}

//! Durable keyed storage for backup artifacts, evidence records and the
//! incident/server records they refer to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::BackupArtifact;
use crate::error::Result;
use crate::evidence::EvidenceRecord;

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentRecord {
    pub id: String,
    pub site_id: String,
    pub server_id: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IncidentRecord {
    pub fn new(
        id: impl Into<String>,
        site_id: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            site_id: site_id.into(),
            server_id: server_id.into(),
            domain: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            ssh_user: None,
            ssh_port: None,
        }
    }
}

pub trait ArtifactStore: Send + Sync {
    fn save_incident(&self, incident: &IncidentRecord) -> Result<()>;
    fn find_incident(&self, id: &str) -> Result<Option<IncidentRecord>>;
    fn save_server(&self, server: &ServerRecord) -> Result<()>;
    fn find_server(&self, id: &str) -> Result<Option<ServerRecord>>;

    fn create_backup(&self, artifact: &BackupArtifact) -> Result<()>;
    fn find_backup(&self, id: &str) -> Result<Option<BackupArtifact>>;
    /// Returns whether a record was removed.
    fn delete_backup(&self, id: &str) -> Result<bool>;
    /// Unordered; callers sort.
    fn list_backups(&self, incident_id: &str) -> Result<Vec<BackupArtifact>>;

    fn create_evidence(&self, record: &EvidenceRecord) -> Result<()>;
    fn find_evidence(&self, id: &str) -> Result<Option<EvidenceRecord>>;
    fn delete_evidence(&self, id: &str) -> Result<bool>;
    /// All evidence, or only one incident's. Unordered; callers sort.
    fn list_evidence(&self, incident_id: Option<&str>) -> Result<Vec<EvidenceRecord>>;
}

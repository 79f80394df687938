//! Remote file and directory backups with checksum validation and
//! newest-first rollback.
//!
//! Every backup lands as a local file whose SHA-256 is recorded alongside
//! the artifact; validation and rollback both re-hash that file before
//! trusting it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEvent, AuditLog};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::remote::{RemoteChannel, Session, sh_quote};
use crate::signature::{self, SignatureAlgorithm};
use crate::store::{ArtifactStore, IncidentRecord, ServerRecord};

mod artifact;
mod restore;

pub use artifact::{
    ArtifactType, BackupArtifact, BackupMetadata, BackupOperationResult, RestoreFailure,
    RollbackOperationResult, ValidationReport,
};
use artifact::CollectedFacts;

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub local_dir: PathBuf,
    pub max_backup_bytes: u64,
    pub remote_temp_dir: String,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl BackupSettings {
    pub fn from_config(cfg: &EngineConfig, base: &Path) -> Self {
        Self {
            local_dir: cfg.backup_dir(base),
            max_backup_bytes: cfg.backup.max_backup_bytes,
            remote_temp_dir: cfg.backup.remote_temp_dir.trim_end_matches('/').to_string(),
            command_timeout: Duration::from_secs(cfg.remote.command_timeout_secs),
            transfer_timeout: Duration::from_secs(cfg.remote.transfer_timeout_secs),
        }
    }

    pub fn with_local_dir(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            max_backup_bytes: crate::config::DEFAULT_MAX_BACKUP_BYTES,
            remote_temp_dir: "/tmp".into(),
            command_timeout: Duration::from_secs(crate::config::DEFAULT_COMMAND_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(300),
        }
    }
}

pub struct BackupManager {
    store: Arc<dyn ArtifactStore>,
    channel: Arc<dyn RemoteChannel>,
    audit: Arc<dyn AuditLog>,
    settings: BackupSettings,
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn sanitize_name(path: &str) -> String {
    let base = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `(parent, name)` of a remote path, for `tar -C parent name`.
pub(crate) fn split_remote_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Some((parent.to_string(), name.to_string()))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// Precondition failures surface as `Err`; anything else is folded into a
// failed `BackupOperationResult`.
fn is_precondition(err: &Error) -> bool {
    matches!(
        err,
        Error::Creation { .. } | Error::NotFound { .. } | Error::InsufficientStorage { .. }
    )
}

impl BackupManager {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        channel: Arc<dyn RemoteChannel>,
        audit: Arc<dyn AuditLog>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            store,
            channel,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    fn resolve(&self, incident_id: &str, server_id: &str) -> Result<(IncidentRecord, ServerRecord)> {
        let incident = self
            .store
            .find_incident(incident_id)?
            .ok_or_else(|| Error::not_found("incident", incident_id))?;
        let server = self
            .store
            .find_server(server_id)?
            .ok_or_else(|| Error::not_found("server", server_id))?;
        Ok((incident, server))
    }

    fn open_session(&self, server: &ServerRecord) -> Result<Session<'_>> {
        Session::open(self.channel.as_ref(), server, self.settings.command_timeout)
    }

    fn local_target(&self, remote_path: &str, artifact_type: ArtifactType, suffix: &str) -> PathBuf {
        let name = format!(
            "{}_{}_{}_{}{}",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            artifact_type.slug(),
            sanitize_name(remote_path),
            short_id(),
            suffix
        );
        self.settings.local_dir.join(name)
    }

    pub fn create_file_backup(
        &self,
        incident_id: &str,
        server_id: &str,
        remote_path: &str,
        artifact_type: ArtifactType,
        metadata: BackupMetadata,
    ) -> Result<BackupOperationResult> {
        let started = Instant::now();
        let outcome = self.file_backup_inner(incident_id, server_id, remote_path, artifact_type, metadata);
        self.finish_create(incident_id, remote_path, artifact_type, started, outcome)
    }

    pub fn create_directory_backup(
        &self,
        incident_id: &str,
        server_id: &str,
        remote_path: &str,
        artifact_type: ArtifactType,
        metadata: BackupMetadata,
    ) -> Result<BackupOperationResult> {
        let started = Instant::now();
        let outcome =
            self.directory_backup_inner(incident_id, server_id, remote_path, artifact_type, metadata);
        self.finish_create(incident_id, remote_path, artifact_type, started, outcome)
    }

    fn finish_create(
        &self,
        incident_id: &str,
        remote_path: &str,
        artifact_type: ArtifactType,
        started: Instant,
        outcome: Result<BackupArtifact>,
    ) -> Result<BackupOperationResult> {
        match outcome {
            Ok(artifact) => {
                info!(
                    incident_id = %incident_id,
                    artifact_id = %artifact.id,
                    path = %remote_path,
                    size_bytes = artifact.size_bytes,
                    "backup created"
                );
                self.audit.log_event(AuditEvent::new(
                    audit::BACKUP_CREATED,
                    "backup_artifact",
                    artifact.id.clone(),
                    json!({
                        "incident_id": incident_id,
                        "server_id": artifact.metadata.server_id,
                        "original_path": artifact.original_path,
                        "artifact_type": artifact.artifact_type,
                        "size_bytes": artifact.size_bytes,
                        "checksum": artifact.checksum,
                    }),
                ));
                Ok(BackupOperationResult {
                    success: true,
                    artifact: Some(artifact),
                    error: None,
                    execution_time_ms: elapsed_ms(started),
                })
            }
            Err(err) => {
                warn!(incident_id = %incident_id, path = %remote_path, error = %err, "backup failed");
                self.audit.log_event(AuditEvent::new(
                    audit::BACKUP_CREATE_FAILED,
                    "backup_artifact",
                    remote_path,
                    json!({
                        "incident_id": incident_id,
                        "artifact_type": artifact_type,
                        "error": err.to_string(),
                    }),
                ));
                if is_precondition(&err) {
                    return Err(err);
                }
                Ok(BackupOperationResult {
                    success: false,
                    artifact: None,
                    error: Some(err.to_string()),
                    execution_time_ms: elapsed_ms(started),
                })
            }
        }
    }

    fn file_backup_inner(
        &self,
        incident_id: &str,
        server_id: &str,
        remote_path: &str,
        artifact_type: ArtifactType,
        metadata: BackupMetadata,
    ) -> Result<BackupArtifact> {
        if remote_path.trim().is_empty() {
            return Err(Error::creation("remote path is empty", remote_path, incident_id));
        }
        let (incident, server) = self.resolve(incident_id, server_id)?;
        let session = self.open_session(&server)?;

        let stat = session
            .stat(remote_path)?
            .ok_or_else(|| Error::creation("remote file does not exist", remote_path, incident_id))?;
        if stat.is_dir {
            return Err(Error::creation(
                "remote path is a directory; use a directory backup",
                remote_path,
                incident_id,
            ));
        }
        if stat.size > self.settings.max_backup_bytes {
            return Err(Error::InsufficientStorage {
                required: stat.size,
                limit: self.settings.max_backup_bytes,
            });
        }

        let local = self.local_target(remote_path, artifact_type, "");
        self.download_to(&session, remote_path, &local)?;

        let collected = CollectedFacts {
            server_id: server.id.clone(),
            permissions: Some(stat.permissions),
            owner: Some(stat.owner),
            group: Some(stat.group),
            original_size: Some(stat.size),
            compression_ratio: None,
        };
        self.persist(&incident, remote_path, artifact_type, local, metadata.merge_collected(collected))
    }

    fn directory_backup_inner(
        &self,
        incident_id: &str,
        server_id: &str,
        remote_path: &str,
        artifact_type: ArtifactType,
        metadata: BackupMetadata,
    ) -> Result<BackupArtifact> {
        if remote_path.trim().is_empty() {
            return Err(Error::creation("remote path is empty", remote_path, incident_id));
        }
        let (incident, server) = self.resolve(incident_id, server_id)?;
        let session = self.open_session(&server)?;

        let stat = session.stat(remote_path)?.ok_or_else(|| {
            Error::creation("remote directory does not exist", remote_path, incident_id)
        })?;
        if !stat.is_dir {
            return Err(Error::creation(
                "remote path is not a directory",
                remote_path,
                incident_id,
            ));
        }
        let size = session.dir_size(remote_path)?;
        if size > self.settings.max_backup_bytes {
            return Err(Error::InsufficientStorage {
                required: size,
                limit: self.settings.max_backup_bytes,
            });
        }
        let (parent, name) = split_remote_path(remote_path).ok_or_else(|| {
            Error::creation("cannot archive the filesystem root", remote_path, incident_id)
        })?;

        let archive = format!(
            "{}/wp-remedy-{}-{}.tar.gz",
            self.settings.remote_temp_dir,
            sanitize_name(remote_path),
            short_id()
        );
        let local = self.local_target(remote_path, artifact_type, ".tar.gz");
        let transferred = (|| {
            let out = session.exec_with_timeout(
                &format!(
                    "tar -czf {} -C {} {}",
                    sh_quote(&archive),
                    sh_quote(&parent),
                    sh_quote(&name)
                ),
                self.settings.transfer_timeout,
            )?;
            if !out.success() {
                return Err(Error::Remote(format!(
                    "tar of {remote_path} failed: {}",
                    out.summary()
                )));
            }
            self.download_to(&session, &archive, &local)
        })();
        if let Err(e) = session.remove(&archive) {
            warn!(archive = %archive, error = %e, "failed to remove remote temp archive");
        }
        transferred?;

        let archive_size = fs::metadata(&local)
            .map_err(|e| Error::Storage(format!("failed to stat {}: {e}", local.display())))?
            .len();
        let collected = CollectedFacts {
            server_id: server.id.clone(),
            permissions: Some(stat.permissions),
            owner: Some(stat.owner),
            group: Some(stat.group),
            original_size: Some(size),
            compression_ratio: (size > 0).then(|| archive_size as f64 / size as f64),
        };
        self.persist(&incident, remote_path, artifact_type, local, metadata.merge_collected(collected))
    }

    fn download_to(&self, session: &Session<'_>, remote: &str, local: &Path) -> Result<()> {
        fs::create_dir_all(&self.settings.local_dir).map_err(|e| {
            Error::Storage(format!(
                "failed to create {}: {e}",
                self.settings.local_dir.display()
            ))
        })?;
        let res = match session.download(remote, local) {
            Ok(res) => res,
            Err(e) => {
                let _ = fs::remove_file(local);
                return Err(e);
            }
        };
        if !res.success {
            let _ = fs::remove_file(local);
            return Err(Error::Remote(format!(
                "download of {remote} failed: {}",
                res.error.unwrap_or_else(|| "unknown error".into())
            )));
        }
        debug!(remote = %remote, local = %local.display(), bytes = res.bytes_transferred, "downloaded");
        Ok(())
    }

    fn persist(
        &self,
        incident: &IncidentRecord,
        remote_path: &str,
        artifact_type: ArtifactType,
        local: PathBuf,
        metadata: BackupMetadata,
    ) -> Result<BackupArtifact> {
        let (checksum, size_bytes) = match signature::digest_file(&local, SignatureAlgorithm::Sha256) {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&local);
                return Err(e);
            }
        };
        let artifact = BackupArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            incident_id: incident.id.clone(),
            artifact_type,
            local_path: local,
            original_path: remote_path.to_string(),
            checksum,
            size_bytes,
            metadata,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.create_backup(&artifact) {
            let _ = fs::remove_file(&artifact.local_path);
            return Err(e);
        }
        Ok(artifact)
    }

    pub fn validate_backup_artifact(&self, artifact_id: &str) -> Result<ValidationReport> {
        let Some(artifact) = self.store.find_backup(artifact_id)? else {
            self.audit.log_event(AuditEvent::new(
                audit::BACKUP_VALIDATED,
                "backup_artifact",
                artifact_id,
                json!({ "found": false, "is_valid": false }),
            ));
            return Err(Error::not_found("backup artifact", artifact_id));
        };
        let report = check_artifact(&artifact);
        self.audit.log_event(AuditEvent::new(
            audit::BACKUP_VALIDATED,
            "backup_artifact",
            artifact_id,
            json!({
                "found": true,
                "incident_id": artifact.incident_id,
                "is_valid": report.is_valid,
                "checksum_match": report.checksum_match,
                "file_exists": report.file_exists,
                "size_match": report.size_match,
            }),
        ));
        Ok(report)
    }

    pub fn delete_backup_artifact(&self, artifact_id: &str) -> Result<()> {
        let artifact = self
            .store
            .find_backup(artifact_id)?
            .ok_or_else(|| Error::not_found("backup artifact", artifact_id))?;
        match fs::remove_file(&artifact.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to remove {}: {e}",
                    artifact.local_path.display()
                )));
            }
        }
        self.store.delete_backup(artifact_id)?;
        info!(artifact_id = %artifact_id, incident_id = %artifact.incident_id, "backup deleted");
        self.audit.log_event(AuditEvent::new(
            audit::BACKUP_DELETED,
            "backup_artifact",
            artifact_id,
            json!({
                "incident_id": artifact.incident_id,
                "original_path": artifact.original_path,
            }),
        ));
        Ok(())
    }

    /// Artifacts of an incident, newest first.
    pub fn list_backups(&self, incident_id: &str) -> Result<Vec<BackupArtifact>> {
        let mut all = self.store.list_backups(incident_id)?;
        sort_newest_first(&mut all);
        Ok(all)
    }

    pub fn get_backup(&self, artifact_id: &str) -> Result<BackupArtifact> {
        self.store
            .find_backup(artifact_id)?
            .ok_or_else(|| Error::not_found("backup artifact", artifact_id))
    }
}

pub(crate) fn sort_newest_first(artifacts: &mut [BackupArtifact]) {
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Re-hashes the local copy of an artifact.
pub(crate) fn check_artifact(artifact: &BackupArtifact) -> ValidationReport {
    let mut report = ValidationReport {
        artifact_id: artifact.id.clone(),
        is_valid: false,
        checksum_match: false,
        file_exists: artifact.local_path.is_file(),
        size_match: false,
        error: None,
    };
    if !report.file_exists {
        report.error = Some(format!(
            "backup file missing at {}",
            artifact.local_path.display()
        ));
        return report;
    }
    let (hex, size) = match signature::digest_file(&artifact.local_path, SignatureAlgorithm::Sha256) {
        Ok(v) => v,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.checksum_match = hex.eq_ignore_ascii_case(&artifact.checksum);
    report.size_match = size == artifact.size_bytes;
    report.is_valid = report.checksum_match && report.size_match;

    let mut problems = Vec::new();
    if !report.checksum_match {
        problems.push(format!(
            "checksum mismatch (expected {}, got {hex})",
            artifact.checksum
        ));
    }
    if !report.size_match {
        problems.push(format!(
            "size mismatch (expected {}, got {size})",
            artifact.size_bytes
        ));
    }
    if !problems.is_empty() {
        report.error = Some(problems.join("; "));
    }
    report
}

use std::time::Instant;

use serde_json::json;
use tracing::{error, info, warn};

use super::{
    BackupArtifact, BackupManager, RestoreFailure, RollbackOperationResult, check_artifact,
    short_id, sort_newest_first, split_remote_path,
};
use crate::audit::{self, AuditEvent};
use crate::error::{Error, Result};
use crate::remote::{Session, sh_quote};

impl BackupManager {
    /// Restores the given artifacts (or every artifact of the incident when
    /// `artifact_ids` is `None`) newest first, one at a time. A failing item
    /// does not stop the batch.
    pub fn execute_rollback(
        &self,
        incident_id: &str,
        artifact_ids: Option<&[String]>,
    ) -> Result<RollbackOperationResult> {
        let started = Instant::now();
        let incident = self
            .store
            .find_incident(incident_id)?
            .ok_or_else(|| Error::RollbackExecution(format!("incident {incident_id} not found")))?;
        let server = self.store.find_server(&incident.server_id)?.ok_or_else(|| {
            Error::RollbackExecution(format!(
                "server {} for incident {incident_id} not found",
                incident.server_id
            ))
        })?;

        let mut failures = Vec::new();
        let mut artifacts = match artifact_ids {
            None => self.store.list_backups(incident_id)?,
            Some(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.find_backup(id)? {
                        Some(a) if a.incident_id == incident_id => found.push(a),
                        Some(a) => failures.push(RestoreFailure {
                            artifact_id: id.clone(),
                            path: a.original_path,
                            error: format!("artifact belongs to incident {}", a.incident_id),
                        }),
                        None => failures.push(RestoreFailure {
                            artifact_id: id.clone(),
                            path: String::new(),
                            error: "artifact not found".into(),
                        }),
                    }
                }
                found
            }
        };
        if artifacts.is_empty() {
            return Err(Error::RollbackExecution(format!(
                "no backup artifacts found for incident {incident_id}"
            )));
        }
        sort_newest_first(&mut artifacts);
        let artifact_count = artifacts.len() + failures.len();

        let mut restored_files = Vec::new();
        let mut processed = Vec::with_capacity(artifacts.len());
        match Session::open(self.channel.as_ref(), &server, self.settings.command_timeout) {
            Ok(session) => {
                for artifact in &artifacts {
                    processed.push(artifact.id.clone());
                    match self.restore_with(&session, artifact) {
                        Ok(()) => {
                            info!(
                                incident_id = %incident_id,
                                artifact_id = %artifact.id,
                                path = %artifact.original_path,
                                "artifact restored"
                            );
                            restored_files.push(artifact.original_path.clone());
                        }
                        Err(e) => {
                            error!(
                                incident_id = %incident_id,
                                artifact_id = %artifact.id,
                                path = %artifact.original_path,
                                error = %e,
                                "artifact restore failed"
                            );
                            failures.push(RestoreFailure {
                                artifact_id: artifact.id.clone(),
                                path: artifact.original_path.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                error!(incident_id = %incident_id, server_id = %server.id, error = %e, "rollback could not connect");
                for artifact in &artifacts {
                    processed.push(artifact.id.clone());
                    failures.push(RestoreFailure {
                        artifact_id: artifact.id.clone(),
                        path: artifact.original_path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let failed_files: Vec<String> = failures.iter().map(|f| f.path.clone()).collect();
        let result = RollbackOperationResult {
            success: failures.is_empty(),
            incident_id: incident_id.to_string(),
            restored_files,
            failed_files,
            failures,
            processed_artifacts: processed,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };
        self.audit.log_event(AuditEvent::new(
            audit::ROLLBACK_EXECUTED,
            "incident",
            incident_id,
            json!({
                "artifact_count": artifact_count,
                "restored": result.restored_files.len(),
                "failed": result.failures.len(),
                "success": result.success,
            }),
        ));
        Ok(result)
    }

    /// Restores one artifact on the server it was taken from.
    pub fn restore_artifact(&self, artifact_id: &str) -> Result<()> {
        let artifact = self.get_backup(artifact_id)?;
        let server_id = match artifact.metadata.server_id.clone() {
            Some(id) => id,
            None => {
                self.store
                    .find_incident(&artifact.incident_id)?
                    .ok_or_else(|| Error::not_found("incident", &artifact.incident_id))?
                    .server_id
            }
        };
        let server = self
            .store
            .find_server(&server_id)?
            .ok_or_else(|| Error::not_found("server", &server_id))?;
        let session = self.open_session(&server)?;
        self.restore_with(&session, &artifact)
    }

    fn restore_with(&self, session: &Session<'_>, artifact: &BackupArtifact) -> Result<()> {
        let report = check_artifact(artifact);
        if !report.is_valid {
            return Err(Error::Corruption {
                artifact_id: artifact.id.clone(),
                message: report
                    .error
                    .unwrap_or_else(|| "validation failed".into()),
            });
        }
        if artifact.artifact_type.is_archive() {
            self.restore_directory(session, artifact)
        } else {
            self.restore_file(session, artifact)?;
            if artifact.artifact_type == super::ArtifactType::DatabaseBackup {
                self.import_database(session, artifact)?;
            }
            Ok(())
        }
    }

    fn restore_file(&self, session: &Session<'_>, artifact: &BackupArtifact) -> Result<()> {
        let target = artifact.original_path.as_str();
        // Staged next to the target so the final mv is a same-filesystem rename.
        let staged = format!("{target}.wp-remedy-restore-{}", short_id());
        if let Some((parent, _)) = split_remote_path(target) {
            session.exec_ok(&format!("mkdir -p {}", sh_quote(&parent)))?;
        }

        let up = session.upload(&artifact.local_path, &staged)?;
        if !up.success {
            let _ = session.remove(&staged);
            return Err(Error::Remote(format!(
                "upload to {staged} failed: {}",
                up.error.unwrap_or_else(|| "unknown error".into())
            )));
        }
        if let Err(e) = session.exec_ok(&format!("mv -f {} {}", sh_quote(&staged), sh_quote(target))) {
            let _ = session.remove(&staged);
            return Err(e);
        }

        let meta = &artifact.metadata;
        if let Some(mode) = meta.original_permissions.as_deref() {
            if let Err(e) = session.exec_ok(&format!("chmod {} {}", sh_quote(mode), sh_quote(target))) {
                warn!(path = %target, error = %e, "could not restore permissions");
            }
        }
        if let (Some(owner), Some(group)) = (meta.original_owner.as_deref(), meta.original_group.as_deref()) {
            let ownership = format!("{owner}:{group}");
            if let Err(e) = session.exec_ok(&format!("chown {} {}", sh_quote(&ownership), sh_quote(target))) {
                warn!(path = %target, error = %e, "could not restore ownership");
            }
        }
        Ok(())
    }

    fn restore_directory(&self, session: &Session<'_>, artifact: &BackupArtifact) -> Result<()> {
        let target = artifact.original_path.as_str();
        let (parent, _) = split_remote_path(target).ok_or_else(|| {
            Error::RollbackExecution(format!("refusing to restore over {target}"))
        })?;
        let archive = format!(
            "{}/wp-remedy-restore-{}.tar.gz",
            self.settings.remote_temp_dir,
            short_id()
        );

        let outcome = (|| {
            let up = session.upload(&artifact.local_path, &archive)?;
            if !up.success {
                return Err(Error::Remote(format!(
                    "upload to {archive} failed: {}",
                    up.error.unwrap_or_else(|| "unknown error".into())
                )));
            }
            session.remove(target)?;
            session.exec_ok(&format!("mkdir -p {}", sh_quote(&parent)))?;
            let out = session.exec_with_timeout(
                &format!("tar -xzf {} -C {}", sh_quote(&archive), sh_quote(&parent)),
                self.settings.transfer_timeout,
            )?;
            if !out.success() {
                return Err(Error::Remote(format!(
                    "extracting {archive} failed: {}",
                    out.summary()
                )));
            }
            Ok(())
        })();
        if let Err(e) = session.remove(&archive) {
            warn!(archive = %archive, error = %e, "failed to remove remote temp archive");
        }
        outcome
    }

    // Database dumps carry the WordPress root in `extra.wordpress_path`;
    // without it only the dump file itself is put back.
    fn import_database(&self, session: &Session<'_>, artifact: &BackupArtifact) -> Result<()> {
        let Some(wp_path) = artifact.metadata.extra_str("wordpress_path") else {
            return Ok(());
        };
        let out = session.exec_with_timeout(
            &format!(
                "wp db import {} --path={} --allow-root",
                sh_quote(&artifact.original_path),
                sh_quote(wp_path)
            ),
            self.settings.transfer_timeout,
        )?;
        if !out.success() {
            return Err(Error::Remote(format!(
                "database import failed: {}",
                out.summary()
            )));
        }
        if let Err(e) = session.remove(&artifact.original_path) {
            warn!(path = %artifact.original_path, error = %e, "failed to remove restored dump");
        }
        Ok(())
    }
}

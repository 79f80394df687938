use std::sync::Arc;
use std::time::Duration;

use crate::backup::{ArtifactType, BackupArtifact, BackupManager, BackupMetadata};
use crate::error::{Error, Result};
use crate::evidence::{EvidenceMetadata, EvidenceRecord, EvidenceRecorder};
use crate::probe::{ProbeResult, SiteProbe, site_url};
use crate::remote::{RemoteChannel, Session, sh_quote};
use crate::store::ArtifactStore;

use super::{FixContext, FixEvidence, RollbackAction, RollbackStep};

/// Shared collaborators handed to every playbook.
pub struct PlaybookDeps {
    pub store: Arc<dyn ArtifactStore>,
    pub channel: Arc<dyn RemoteChannel>,
    pub backups: Arc<BackupManager>,
    pub evidence: Arc<EvidenceRecorder>,
    pub probe: Arc<dyn SiteProbe>,
    pub command_timeout: Duration,
    pub probe_scheme: String,
}

impl PlaybookDeps {
    pub fn session(&self, ctx: &FixContext) -> Result<Session<'_>> {
        let server = self
            .store
            .find_server(&ctx.server_id)?
            .ok_or_else(|| Error::not_found("server", &ctx.server_id))?;
        Session::open(self.channel.as_ref(), &server, self.command_timeout)
    }

    /// `wp <args>` pinned to the site's WordPress root.
    pub fn wp(&self, ctx: &FixContext, args: &str) -> String {
        format!(
            "wp {args} --path={} --allow-root",
            sh_quote(&ctx.wordpress_path)
        )
    }

    pub fn backup_file(
        &self,
        ctx: &FixContext,
        path: &str,
        artifact_type: ArtifactType,
        reason: &str,
    ) -> Result<BackupArtifact> {
        self.backups
            .create_file_backup(
                &ctx.incident_id,
                &ctx.server_id,
                path,
                artifact_type,
                BackupMetadata::reason(reason)
                    .with_extra("correlation_id", ctx.correlation_id.as_str()),
            )?
            .into_artifact()
    }

    pub fn backup_dir(
        &self,
        ctx: &FixContext,
        path: &str,
        artifact_type: ArtifactType,
        reason: &str,
    ) -> Result<BackupArtifact> {
        self.backups
            .create_directory_backup(
                &ctx.incident_id,
                &ctx.server_id,
                path,
                artifact_type,
                BackupMetadata::reason(reason)
                    .with_extra("correlation_id", ctx.correlation_id.as_str()),
            )?
            .into_artifact()
    }

    /// Dumps the site database to the remote temp dir and keeps the dump as a
    /// `DatabaseBackup` artifact; restoring it re-imports the dump.
    pub fn backup_database(&self, ctx: &FixContext, reason: &str) -> Result<BackupArtifact> {
        let session = self.session(ctx)?;
        let dump = format!(
            "{}/wp-remedy-db-{}.sql",
            self.backups.settings().remote_temp_dir,
            uuid::Uuid::new_v4().simple()
        );
        let out = session.exec_with_timeout(
            &self.wp(ctx, &format!("db export {}", sh_quote(&dump))),
            self.backups.settings().transfer_timeout,
        )?;
        if !out.success() {
            let _ = session.remove(&dump);
            return Err(Error::Remote(format!(
                "database export failed: {}",
                out.summary()
            )));
        }
        let created = self.backups.create_file_backup(
            &ctx.incident_id,
            &ctx.server_id,
            &dump,
            ArtifactType::DatabaseBackup,
            BackupMetadata::reason(reason)
                .with_extra("correlation_id", ctx.correlation_id.as_str())
                .with_extra("wordpress_path", ctx.wordpress_path.as_str()),
        );
        let _ = session.remove(&dump);
        created?.into_artifact()
    }

    pub fn check_site(&self, ctx: &FixContext) -> ProbeResult {
        self.probe.check(&site_url(&self.probe_scheme, &ctx.domain))
    }

    /// Persists a playbook observation as an evidence record.
    pub fn persist_evidence(&self, ctx: &FixContext, ev: &FixEvidence) -> Result<EvidenceRecord> {
        let mut meta = EvidenceMetadata::default()
            .with_extra("description", ev.description.as_str())
            .with_extra("correlation_id", ctx.correlation_id.as_str())
            .with_extra("fix_signature", ev.signature.as_str());
        if let Some(m) = &ev.metadata {
            meta = meta.with_extra("fix_metadata", m.clone());
        }
        self.evidence
            .store_evidence(&ctx.incident_id, ev.evidence_type, &ev.content, meta)
    }

    pub fn execute_rollback_step(&self, ctx: &FixContext, step: &RollbackStep) -> Result<()> {
        match &step.action {
            RollbackAction::RestoreBackup { artifact_id } => self.backups.restore_artifact(artifact_id),
            RollbackAction::RunCommand { command } => {
                self.session(ctx)?.exec_ok(command)?;
                Ok(())
            }
            RollbackAction::ActivatePlugins { plugins } => {
                if plugins.is_empty() {
                    return Ok(());
                }
                let names: Vec<String> = plugins.iter().map(|p| sh_quote(p)).collect();
                self.session(ctx)?
                    .exec_ok(&self.wp(ctx, &format!("plugin activate {}", names.join(" "))))?;
                Ok(())
            }
            RollbackAction::RemoveFile { path } => {
                self.session(ctx)?
                    .exec_ok(&format!("rm -f {}", sh_quote(path)))?;
                Ok(())
            }
        }
    }
}

use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use wp_remedy_macros::Playbook;

use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixResult, FixRun, PlaybookDeps,
    PlaybookInfo, RollbackAction, evidence_matches,
};
use crate::backup::ArtifactType;
use crate::error::{Error, Result};
use crate::evidence::EvidenceType;
use crate::remote::{Session, sh_quote};

// More than this many damaged files points at something other than a few
// corrupted core files; leave it to a human.
const MAX_RESTORED_FILES: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumReport {
    pub modified: Vec<String>,
    pub missing: Vec<String>,
}

impl ChecksumReport {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.missing.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.modified.len() + self.missing.len()
    }
}

/// Parses `wp core verify-checksums` output. Extra files ("should not
/// exist") are ignored.
pub fn parse_checksum_output(output: &str) -> ChecksumReport {
    let mut report = ChecksumReport::default();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.split_once("File doesn't verify against checksum:") {
            report.modified.push(rest.1.trim().to_string());
        } else if let Some(rest) = line.split_once("File doesn't exist:") {
            report.missing.push(rest.1.trim().to_string());
        }
    }
    report
}

// Only relative paths inside the WordPress tree are restored.
fn safe_relative(rel: &str) -> bool {
    !rel.is_empty() && !rel.starts_with('/') && !rel.split('/').any(|seg| seg == "..")
}

#[Playbook(
    id = "core_integrity",
    name = "WordPress core integrity",
    description = "Verifies core checksums and restores missing or modified core files from the matching release",
    tier = "core_integrity",
    priority = "critical",
    symptoms = [
        "doesn't verify against checksum",
        "Failed opening required",
        "wp-includes/",
        "wp-settings.php",
        "wp-admin/includes"
    ]
)]
pub struct CoreIntegrityPlaybook {
    deps: Arc<PlaybookDeps>,
}

impl CoreIntegrityPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self { deps }
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;
        let version = session.exec_ok(&self.deps.wp(ctx, "core version"))?;
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
            return Err(Error::Remote(format!("unexpected core version '{version}'")));
        }
        run.observe(EvidenceType::WordpressInfo, "core version", version.as_str());
        run.note("core_version", version.as_str());

        let verify = run.probe(
            &session,
            "core checksum verification",
            &self.deps.wp(ctx, "core verify-checksums 2>&1"),
        )?;
        let report = parse_checksum_output(&format!("{}\n{}", verify.stdout, verify.stderr));
        if report.is_clean() {
            if !verify.success() {
                run.fail(format!("checksum verification failed: {}", verify.summary()));
            }
            return Ok(());
        }
        run.evidence(
            FixEvidence::new(
                EvidenceType::DiagnosticReport,
                "damaged core files",
                format!(
                    "modified:\n{}\nmissing:\n{}",
                    report.modified.join("\n"),
                    report.missing.join("\n")
                ),
            )
            .with_metadata(json!({ "modified": report.modified.len(), "missing": report.missing.len() })),
        );
        if report.file_count() > MAX_RESTORED_FILES {
            run.fail(format!(
                "{} core files differ from release {version}; refusing bulk restore",
                report.file_count()
            ));
            return Ok(());
        }

        let staging = format!(
            "{}/wp-remedy-core-{}",
            self.deps.backups.settings().remote_temp_dir,
            uuid::Uuid::new_v4().simple()
        );
        let outcome = self.restore_from_release(ctx, &session, run, &version, &staging, &report);
        if let Err(e) = session.remove(&staging) {
            warn!(incident_id = %ctx.incident_id, staging = %staging, error = %e, "failed to clean core staging dir");
        }
        outcome
    }

    fn restore_from_release(
        &self,
        ctx: &FixContext,
        session: &Session<'_>,
        run: &mut FixRun,
        version: &str,
        staging: &str,
        report: &ChecksumReport,
    ) -> Result<()> {
        let tarball = format!("{staging}/wordpress.tar.gz");
        let fetch = format!(
            "mkdir -p {dir} && curl -fsSL {url} -o {tar} && tar -xzf {tar} -C {dir}",
            dir = sh_quote(staging),
            url = sh_quote(&format!("https://wordpress.org/wordpress-{version}.tar.gz")),
            tar = sh_quote(&tarball),
        );
        let out = session.exec_with_timeout(&fetch, self.deps.backups.settings().transfer_timeout)?;
        run.observe(
            EvidenceType::CommandOutput,
            "download core release",
            format!("$ {fetch}\nexit {}\n{}", out.exit_code, out.summary()),
        );
        if !out.success() {
            return Err(Error::Remote(format!(
                "could not fetch WordPress {version}: {}",
                out.summary()
            )));
        }

        let mut restored = Vec::new();
        for rel in &report.modified {
            if !safe_relative(rel) {
                continue;
            }
            let target = ctx.wp_path(rel);
            let artifact = self
                .deps
                .backup_file(ctx, &target, ArtifactType::FileBackup, "core file restore")?;
            run.backed_up(&artifact);
            run.mutate(
                session,
                FixChange::file(format!("replaced modified core file {rel}"), target.clone()),
                &format!(
                    "cp -f {} {}",
                    sh_quote(&format!("{staging}/wordpress/{rel}")),
                    sh_quote(&target)
                ),
            )?;
            restored.push(target);
        }
        for rel in &report.missing {
            if !safe_relative(rel) {
                continue;
            }
            let target = ctx.wp_path(rel);
            // Nothing to back up; undo removes the file again.
            run.undo_with(
                format!("remove restored {rel}"),
                RollbackAction::RemoveFile { path: target.clone() },
            );
            let parent = target.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
            run.mutate(
                session,
                FixChange::file(format!("restored missing core file {rel}"), target.clone()),
                &format!(
                    "mkdir -p {} && cp {} {}",
                    sh_quote(parent),
                    sh_quote(&format!("{staging}/wordpress/{rel}")),
                    sh_quote(&target)
                ),
            )?;
            restored.push(target);
        }

        let mut syntax_errors = Vec::new();
        for target in restored.iter().filter(|t| t.ends_with(".php")) {
            let out = session.exec(&format!("php -l {} 2>&1", sh_quote(target)))?;
            if !out.success() {
                syntax_errors.push(format!("{target}: {}", out.summary()));
            }
        }
        run.observe(
            EvidenceType::DiagnosticReport,
            "php syntax check of restored files",
            if syntax_errors.is_empty() {
                format!("{} files OK", restored.len())
            } else {
                syntax_errors.join("\n")
            },
        );
        run.note("restored_files", restored.len());
        if !syntax_errors.is_empty() {
            run.fail(format!("{} restored files fail php -l", syntax_errors.len()));
            return Ok(());
        }

        let recheck = run.probe(
            session,
            "core checksum re-verification",
            &self.deps.wp(ctx, "core verify-checksums 2>&1"),
        )?;
        let after = parse_checksum_output(&format!("{}\n{}", recheck.stdout, recheck.stderr));
        if !after.is_clean() {
            run.fail(format!("{} core files still differ after restore", after.file_count()));
        }
        Ok(())
    }
}

impl FixPlaybook for CoreIntegrityPlaybook {
    fn info(&self) -> PlaybookInfo {
        Self::playbook_info()
    }

    fn deps(&self) -> &PlaybookDeps {
        &self.deps
    }

    fn can_apply(&self, ctx: &FixContext, evidence: &[FixEvidence]) -> Result<bool> {
        if evidence_matches(evidence, Self::matches_symptoms) {
            return Ok(true);
        }
        let session = self.deps.session(ctx)?;
        let out = session.exec(&self.deps.wp(ctx, "core verify-checksums 2>&1"))?;
        Ok(!parse_checksum_output(&out.stdout).is_clean())
    }

    fn hypothesis(&self, _ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, Self::matches_symptoms) {
            return "The collected errors point at damaged WordPress core files; restoring them from the matching release fixes the errors".into();
        }
        "Core checksum verification reports missing or modified files; restoring them from the matching release removes the drift".into()
    }

    fn apply(&self, ctx: &FixContext) -> FixResult {
        let mut run = FixRun::new(Self::ID);
        let outcome = self.fix(ctx, &mut run);
        run.finish(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verify_checksums_warnings() {
        let out = "Warning: File doesn't verify against checksum: wp-includes/version.php\n\
Warning: File doesn't exist: wp-admin/index.php\n\
Warning: File should not exist: wp-content/evil.php\n\
Error: WordPress installation doesn't verify against checksums.";
        let report = parse_checksum_output(out);
        assert_eq!(report.modified, vec!["wp-includes/version.php"]);
        assert_eq!(report.missing, vec!["wp-admin/index.php"]);
        assert_eq!(report.file_count(), 2);
    }

    #[test]
    fn clean_install_has_no_findings() {
        let report =
            parse_checksum_output("Success: WordPress installation verifies against checksums.");
        assert!(report.is_clean());
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(safe_relative("wp-includes/load.php"));
        assert!(!safe_relative("../etc/passwd"));
        assert!(!safe_relative("/etc/passwd"));
        assert!(!safe_relative(""));
    }
}

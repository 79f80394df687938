use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backup::BackupArtifact;
use crate::error::{Error, Result};
use crate::evidence::EvidenceType;
use crate::remote::{CommandOutput, Session};

use super::{FixChange, FixEvidence, FixResult, RollbackAction, RollbackPlan};

/// Accumulates what one `apply` call observed and changed.
#[derive(Debug)]
pub struct FixRun {
    playbook: &'static str,
    changes: Vec<FixChange>,
    evidence: Vec<FixEvidence>,
    plan: RollbackPlan,
    metadata: BTreeMap<String, Value>,
    failure: Option<String>,
}

impl FixRun {
    pub fn new(playbook: &'static str) -> Self {
        let mut plan = RollbackPlan::default();
        plan.metadata
            .insert("playbook".into(), Value::String(playbook.to_string()));
        Self {
            playbook,
            changes: Vec::new(),
            evidence: Vec::new(),
            plan,
            metadata: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn evidence(&mut self, ev: FixEvidence) {
        self.evidence.push(ev);
    }

    pub fn observe(&mut self, evidence_type: EvidenceType, description: &str, content: impl Into<String>) {
        self.evidence
            .push(FixEvidence::new(evidence_type, description, content));
    }

    /// Runs a probe command and records its output as evidence.
    pub fn probe(&mut self, session: &Session<'_>, description: &str, command: &str) -> Result<CommandOutput> {
        let out = session.exec(command)?;
        debug!(playbook = self.playbook, command = %command, exit_code = out.exit_code, "probe");
        self.evidence.push(
            FixEvidence::new(
                EvidenceType::CommandOutput,
                description,
                format!("$ {command}\n{}{}", out.stdout, out.stderr),
            )
            .with_metadata(serde_json::json!({ "exit_code": out.exit_code, "timed_out": out.timed_out })),
        );
        Ok(out)
    }

    /// Runs a mutating command, records its output as evidence and the
    /// change on success. A non-zero exit is an error.
    pub fn mutate(&mut self, session: &Session<'_>, change: FixChange, command: &str) -> Result<String> {
        self.mutate_shown(session, change, command, command)
    }

    /// Like [`mutate`](Self::mutate), but evidence shows `shown` instead of
    /// the command, for commands that carry a generated secret.
    pub fn mutate_shown(
        &mut self,
        session: &Session<'_>,
        change: FixChange,
        command: &str,
        shown: &str,
    ) -> Result<String> {
        let out = session.exec(command)?;
        debug!(playbook = self.playbook, command = %shown, exit_code = out.exit_code, "mutation");
        self.evidence.push(
            FixEvidence::new(
                EvidenceType::CommandOutput,
                change.description.as_str(),
                format!("$ {shown}\n{}{}", out.stdout, out.stderr),
            )
            .with_metadata(serde_json::json!({
                "exit_code": out.exit_code,
                "timed_out": out.timed_out,
                "mutation": true,
            })),
        );
        if !out.success() {
            return Err(Error::Remote(format!(
                "command failed ({}): {}",
                out.exit_code,
                out.summary()
            )));
        }
        self.changes.push(change);
        Ok(out.stdout.trim().to_string())
    }

    /// Registers a fresh backup as the undo for whatever is changed next.
    pub fn backed_up(&mut self, artifact: &BackupArtifact) {
        self.plan.push(
            format!("restore {}", artifact.original_path),
            RollbackAction::RestoreBackup {
                artifact_id: artifact.id.clone(),
            },
        );
        self.evidence.push(
            FixEvidence::new(
                EvidenceType::DiagnosticReport,
                "backup created",
                format!(
                    "{} backed up as {} (sha256 {})",
                    artifact.original_path, artifact.id, artifact.checksum
                ),
            )
            .with_metadata(serde_json::json!({ "artifact_id": artifact.id })),
        );
    }

    pub fn undo_with(&mut self, description: impl Into<String>, action: RollbackAction) {
        self.plan.push(description, action);
    }

    pub fn change(&mut self, change: FixChange) {
        self.changes.push(change);
    }

    pub fn note(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Marks the run unsuccessful without aborting it.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(playbook = self.playbook, reason = %reason, "fix unsuccessful");
        self.failure.get_or_insert(reason);
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn finish(self, outcome: Result<()>) -> FixResult {
        let applied = !self.changes.is_empty();
        let error = match outcome {
            Ok(()) => self.failure,
            Err(e) => Some(e.to_string()),
        };
        if applied && self.plan.is_empty() {
            warn!(playbook = self.playbook, "changes recorded without a rollback plan");
        }
        FixResult {
            success: error.is_none(),
            applied,
            changes: self.changes,
            evidence: self.evidence,
            rollback_plan: (!self.plan.is_empty()).then_some(self.plan),
            metadata: self.metadata,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn error_after_changes_keeps_applied_and_plan() {
        let mut run = FixRun::new("t");
        run.undo_with("undo", RollbackAction::RunCommand { command: "true".into() });
        run.change(FixChange::command("did it", "true"));
        let res = run.finish(Err(Error::msg("verification exploded")));
        assert!(!res.success);
        assert!(res.applied);
        assert!(res.rollback_plan.is_some());
        assert_eq!(res.error.as_deref(), Some("verification exploded"));
    }

    #[test]
    fn clean_run_without_changes_is_not_applied() {
        let mut run = FixRun::new("t");
        run.observe(EvidenceType::DiagnosticReport, "looked", "all fine");
        let res = run.finish(Ok(()));
        assert!(res.success);
        assert!(!res.applied);
        assert!(res.rollback_plan.is_none());
        assert_eq!(res.evidence.len(), 1);
    }

    #[test]
    fn mutations_leave_evidence_even_when_they_fail() {
        let channel = crate::remote::LocalChannel::new();
        let server = crate::store::ServerRecord::new("s", "localhost");
        let session = Session::open(&channel, &server, std::time::Duration::from_secs(5)).expect("session");
        let mut run = FixRun::new("t");

        let out = run
            .mutate_shown(
                &session,
                FixChange::command("set key", "true"),
                "true abc123secret && echo done",
                "true <generated> && echo done",
            )
            .expect("mutate");
        assert_eq!(out, "done");
        assert!(run.mutate(&session, FixChange::command("broken", "false"), "false").is_err());

        let res = run.finish(Ok(()));
        assert_eq!(res.changes.len(), 1);
        assert_eq!(res.evidence.len(), 2);
        assert_eq!(res.evidence[0].content, "$ true <generated> && echo done\ndone\n");
        assert_eq!(res.evidence[1].description, "broken");
        assert_eq!(res.evidence[1].metadata.as_ref().expect("metadata")["exit_code"], 1);
    }

    #[test]
    fn soft_failure_keeps_first_reason() {
        let mut run = FixRun::new("t");
        run.fail("first");
        run.fail("second");
        let res = run.finish(Ok(()));
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("first"));
    }
}

use std::sync::Arc;

use tracing::{info, warn};

use super::{FixContext, FixEvidence, FixPlaybook, FixResult, PlaybookDeps, PlaybookInfo};
use crate::error::{Error, Result};

/// Playbooks ordered by tier, then priority, then id.
pub struct PlaybookRegistry {
    playbooks: Vec<Box<dyn FixPlaybook>>,
}

impl PlaybookRegistry {
    pub fn new(mut playbooks: Vec<Box<dyn FixPlaybook>>) -> Self {
        playbooks.sort_by_key(|p| {
            let info = p.info();
            (info.tier, info.priority, info.id)
        });
        Self { playbooks }
    }

    pub fn builtin(deps: Arc<PlaybookDeps>) -> Self {
        Self::new(super::builtin_playbooks(deps))
    }

    pub fn infos(&self) -> Vec<PlaybookInfo> {
        self.playbooks.iter().map(|p| p.info()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&dyn FixPlaybook> {
        self.playbooks
            .iter()
            .find(|p| p.info().id == id)
            .map(|p| &**p)
    }

    /// Playbooks whose `can_apply` holds, in registry order. A playbook whose
    /// check errors is skipped.
    pub fn applicable(&self, ctx: &FixContext, evidence: &[FixEvidence]) -> Vec<&dyn FixPlaybook> {
        self.playbooks
            .iter()
            .filter(|p| match p.can_apply(ctx, evidence) {
                Ok(yes) => yes,
                Err(e) => {
                    warn!(playbook = p.info().id, incident_id = %ctx.incident_id, error = %e, "applicability check failed");
                    false
                }
            })
            .map(|p| &**p)
            .collect()
    }

    /// Applies one playbook, persists its evidence, and runs its rollback
    /// plan when the fix changed something but did not succeed.
    pub fn run(&self, id: &str, ctx: &FixContext, auto_rollback: bool) -> Result<FixResult> {
        let playbook = self
            .get(id)
            .ok_or_else(|| Error::not_found("playbook", id))?;
        info!(playbook = id, incident_id = %ctx.incident_id, correlation_id = %ctx.correlation_id, "applying playbook");
        let mut result = playbook.apply(ctx);

        for ev in &result.evidence {
            if let Err(e) = playbook.deps().persist_evidence(ctx, ev) {
                warn!(playbook = id, incident_id = %ctx.incident_id, error = %e, "failed to persist fix evidence");
            }
        }

        if auto_rollback && result.applied && !result.success {
            if let Some(plan) = result.rollback_plan.as_ref() {
                let rolled_back = playbook.rollback(ctx, plan);
                result
                    .metadata
                    .insert("rolled_back".into(), serde_json::Value::Bool(rolled_back));
            }
        }
        info!(
            playbook = id,
            incident_id = %ctx.incident_id,
            success = result.success,
            applied = result.applied,
            changes = result.changes.len(),
            "playbook finished"
        );
        Ok(result)
    }
}

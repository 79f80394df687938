use std::sync::Arc;

use serde_json::json;
use wp_remedy_macros::Playbook;

use super::php_error_log::{find_error_log, plugin_mentions};
use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixResult, FixRun, PlaybookDeps,
    PlaybookInfo, RollbackAction, evidence_matches,
};
use crate::backup::ArtifactType;
use crate::error::Result;
use crate::evidence::EvidenceType;
use crate::remote::{Session, sh_quote};

// Beyond this many suspects the log is too noisy to act on.
const MAX_DEACTIVATED: usize = 5;

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('.')
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Active plugins named in the log, most mentioned first.
pub fn implicated_plugins(active: &[String], log: &str) -> Vec<String> {
    let mentions = plugin_mentions(log);
    let mut hits: Vec<(&String, usize)> = active
        .iter()
        .filter_map(|p| mentions.get(p).map(|n| (p, *n)))
        .collect();
    hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    hits.into_iter().map(|(p, _)| p.clone()).collect()
}

#[Playbook(
    id = "plugin_conflict",
    name = "Plugin conflict isolation",
    description = "Deactivates active plugins implicated by the PHP error log and re-tests the site",
    tier = "plugin_theme_conflicts",
    priority = "high",
    symptoms = [
        "wp-content/plugins/",
        "There has been a critical error on this website",
        "Cannot redeclare",
        "Call to undefined function",
        "white screen"
    ]
)]
pub struct PluginConflictPlaybook {
    deps: Arc<PlaybookDeps>,
}

impl PluginConflictPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self { deps }
    }

    fn active_plugins(&self, ctx: &FixContext, session: &Session<'_>) -> Result<Vec<String>> {
        let raw = session.exec_ok(&self.deps.wp(ctx, "plugin list --status=active --field=name"))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| valid_slug(l))
            .map(str::to_string)
            .collect())
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;
        let active = self.active_plugins(ctx, &session)?;
        run.observe(EvidenceType::WordpressInfo, "active plugins", active.join("\n"));
        if active.is_empty() {
            return Ok(());
        }

        let log = match find_error_log(&session, ctx)? {
            Some(path) => session.exec_ok(&format!(
                "tail -n {} {}",
                self.deps.evidence.settings().max_log_lines,
                sh_quote(&path)
            ))?,
            None => String::new(),
        };
        let suspects = implicated_plugins(&active, &log);
        run.evidence(
            FixEvidence::new(
                EvidenceType::DiagnosticReport,
                "plugins implicated by the error log",
                if suspects.is_empty() {
                    "none".to_string()
                } else {
                    suspects.join("\n")
                },
            )
            .with_metadata(json!({ "active": active.len(), "implicated": suspects })),
        );
        if suspects.is_empty() {
            let probe = self.deps.check_site(ctx);
            if !probe.healthy() {
                run.fail("site is unhealthy but no active plugin is named in the error log");
            }
            return Ok(());
        }
        if suspects.len() > MAX_DEACTIVATED {
            run.fail(format!(
                "{} plugins are implicated; refusing to deactivate them all",
                suspects.len()
            ));
            return Ok(());
        }

        for slug in &suspects {
            let dir = ctx.wp_path(&format!("wp-content/plugins/{slug}"));
            let artifact = self
                .deps
                .backup_dir(ctx, &dir, ArtifactType::PluginBackup, "plugin deactivation")?;
            // Undo runs newest first: restore the files, then reactivate.
            run.undo_with(
                format!("reactivate {slug}"),
                RollbackAction::ActivatePlugins {
                    plugins: vec![slug.clone()],
                },
            );
            run.backed_up(&artifact);
            let cmd = self.deps.wp(ctx, &format!("plugin deactivate {}", sh_quote(slug)));
            run.mutate(
                &session,
                FixChange::command(format!("deactivated plugin {slug}"), cmd.as_str()),
                &cmd,
            )?;
        }
        run.note("deactivated_plugins", json!(suspects));

        let probe = self.deps.check_site(ctx);
        run.evidence(
            FixEvidence::new(
                EvidenceType::DiagnosticReport,
                "site check after deactivation",
                serde_json::to_string_pretty(&probe)?,
            )
            .with_metadata(json!({ "healthy": probe.healthy() })),
        );
        if !probe.healthy() {
            run.fail(format!(
                "{} still unhealthy after deactivating {}",
                probe.url,
                suspects.join(", ")
            ));
        }
        Ok(())
    }
}

impl FixPlaybook for PluginConflictPlaybook {
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
        Ok(!self.deps.check_site(ctx).healthy())
    }

    fn hypothesis(&self, _ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, Self::matches_symptoms) {
            return "The collected errors name an active plugin; deactivating it brings the site back".into();
        }
        "The PHP error log on the server names an active plugin in recent fatal errors; deactivating it brings the site back".into()
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
    fn only_active_plugins_are_implicated() {
        let active = vec!["akismet".to_string(), "heavy-gallery".to_string(), "seo-tool".to_string()];
        let log = "\
PHP Fatal error: x in /var/www/wp-content/plugins/heavy-gallery/a.php:1
PHP Fatal error: y in /var/www/wp-content/plugins/heavy-gallery/b.php:2
PHP Warning: z in /var/www/wp-content/plugins/seo-tool/s.php:3
PHP Warning: w in /var/www/wp-content/plugins/inactive-thing/i.php:4
";
        assert_eq!(implicated_plugins(&active, log), vec!["heavy-gallery", "seo-tool"]);
        assert!(implicated_plugins(&active, "").is_empty());
    }

    #[test]
    fn slugs_are_validated() {
        assert!(valid_slug("woocommerce"));
        assert!(valid_slug("wp-super_cache.v2"));
        assert!(!valid_slug(""));
        assert!(!valid_slug("..hidden"));
        assert!(!valid_slug("a b"));
        assert!(!valid_slug("a/b"));
    }
}

use std::sync::Arc;

use serde_json::json;
use wp_remedy_macros::Playbook;

use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixResult, FixRun, PlaybookDeps,
    PlaybookInfo, RollbackAction, evidence_matches,
};
use crate::error::Result;
use crate::evidence::EvidenceType;
use crate::remote::{Session, sh_quote};

const SERVICE_CANDIDATES: &[&str] = &["mariadb", "mysql", "mysqld"];

/// Output of `wp db check` that indicates damaged tables rather than a
/// connection problem.
pub fn check_reports_damage(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("crashed")
        || lower.contains("corrupt")
        || lower.contains("should be repaired")
        || lower
            .lines()
            .any(|l| l.contains("error") && !l.contains("error establishing"))
}

fn is_connection_failure(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    [
        "error establishing a database connection",
        "can't connect",
        "connection refused",
        "access denied",
        "server has gone away",
        "unknown mysql server host",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

#[Playbook(
    id = "database_connection",
    name = "Database connection restoration",
    description = "Restores database connectivity: service liveness, restart, credential hints, table repair and optimization",
    tier = "infrastructure",
    priority = "critical",
    symptoms = [
        "Error establishing a database connection",
        "Can't connect to MySQL",
        "Can't connect to local MySQL server",
        "MySQL server has gone away",
        "Too many connections",
        "mysqld is not running"
    ]
)]
pub struct DatabaseConnectionPlaybook {
    deps: Arc<PlaybookDeps>,
}

impl DatabaseConnectionPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self { deps }
    }

    fn detect_service(&self, session: &Session<'_>) -> Result<Option<String>> {
        for svc in SERVICE_CANDIDATES {
            let out = session.exec(&format!(
                "systemctl list-unit-files {} --no-legend 2>/dev/null",
                sh_quote(&format!("{svc}.service"))
            ))?;
            if out.success() && out.stdout.trim_start().starts_with(&format!("{svc}.service")) {
                return Ok(Some(svc.to_string()));
            }
        }
        Ok(None)
    }

    fn ping(&self, run: &mut FixRun, session: &Session<'_>, label: &str) -> Result<bool> {
        let out = run.probe(session, label, "mysqladmin ping --connect-timeout=5 2>&1")?;
        Ok(out.success() && out.stdout.contains("alive"))
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;

        if !self.ping(run, &session, "database liveness")? {
            let Some(service) = self.detect_service(&session)? else {
                run.fail("database server is down and no mysql/mariadb unit was found");
                return Ok(());
            };
            let restart = format!("systemctl restart {}", sh_quote(&service));
            run.undo_with(
                format!("stop {service} restarted by this fix"),
                RollbackAction::RunCommand {
                    command: format!("systemctl stop {}", sh_quote(&service)),
                },
            );
            let out = run.probe(&session, "restart database service", &restart)?;
            run.change(FixChange::command(format!("restarted {service}"), restart));
            run.note("restarted_service", service.as_str());
            if !out.success() || !self.ping(run, &session, "database liveness after restart")? {
                run.fail(format!("{service} did not come back after restart"));
                return Ok(());
            }
        }

        // Credentials are only reported; rewriting them needs a human.
        let mut hints = serde_json::Map::new();
        for key in ["DB_HOST", "DB_NAME", "DB_USER"] {
            let out = session.exec(&self.deps.wp(ctx, &format!("config get {key}")))?;
            hints.insert(
                key.to_string(),
                json!(out.success().then(|| out.stdout.trim().to_string())),
            );
        }
        run.evidence(
            FixEvidence::new(
                EvidenceType::DatabaseInfo,
                "wp-config database settings",
                serde_json::to_string_pretty(&hints)?,
            )
            .with_metadata(json!({ "password_checked": false })),
        );

        let check = run.probe(&session, "database table check", &self.deps.wp(ctx, "db check 2>&1"))?;
        if check.success() && !check_reports_damage(&check.stdout) {
            return Ok(());
        }
        if is_connection_failure(&format!("{}{}", check.stdout, check.stderr)) {
            run.fail(format!(
                "WordPress still cannot connect to the database; verify credentials in {}",
                ctx.wp_config_path()
            ));
            return Ok(());
        }

        let artifact = self.deps.backup_database(ctx, "database repair")?;
        run.backed_up(&artifact);

        let repair = self.deps.wp(ctx, "db repair");
        let out = run.probe(&session, "repair tables", &repair)?;
        run.change(FixChange::command("repaired database tables", repair));
        if !out.success() {
            run.fail(format!("table repair failed: {}", out.summary()));
            return Ok(());
        }
        let optimize = self.deps.wp(ctx, "db optimize");
        let out = run.probe(&session, "optimize tables", &optimize)?;
        run.change(FixChange::command("optimized database tables", optimize));
        if !out.success() {
            run.fail(format!("optimization failed: {}", out.summary()));
            return Ok(());
        }

        let verify = run.probe(&session, "database re-check", &self.deps.wp(ctx, "db check 2>&1"))?;
        if !verify.success() || check_reports_damage(&verify.stdout) {
            run.fail("database check still reports problems after repair");
        }
        Ok(())
    }
}

impl FixPlaybook for DatabaseConnectionPlaybook {
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
        let out = session.exec(&self.deps.wp(ctx, "db check 2>&1"))?;
        Ok(!out.success())
    }

    fn hypothesis(&self, _ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, |t| t.contains("Too many connections")) {
            return "The database server is saturated; restarting it clears stuck connections".into();
        }
        "The database server is down or its tables are damaged; restarting the service and repairing tables restores connectivity".into()
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
    fn damage_detection_ignores_healthy_check() {
        assert!(!check_reports_damage(
            "wordpress.wp_posts   OK\nwordpress.wp_options   OK\nSuccess: Database checked."
        ));
        assert!(check_reports_damage(
            "wordpress.wp_options\nerror    : Table './wordpress/wp_options' is marked as crashed and should be repaired"
        ));
    }

    #[test]
    fn connection_failures_are_recognized() {
        assert!(is_connection_failure(
            "Error: Error establishing a database connection."
        ));
        assert!(is_connection_failure(
            "mysqlcheck: Got error: 2002: Can't connect to local MySQL server"
        ));
        assert!(!is_connection_failure("Success: Database checked."));
    }
}

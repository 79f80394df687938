use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use wp_remedy_macros::Playbook;

use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixResult, FixRun, PlaybookDeps,
    PlaybookInfo, evidence_matches,
};
use crate::error::{Error, Result};
use crate::evidence::EvidenceType;
use crate::remote::{Session, sh_quote};

/// Tables flagged by `CHECK TABLE` output (`Table, Op, Msg_type, Msg_text`
/// as tab-separated rows without a header).
pub fn damaged_tables(check_output: &str) -> Vec<String> {
    let mut bad = BTreeSet::new();
    for line in check_output.lines() {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 4 {
            continue;
        }
        let table = cols[0].rsplit('.').next().unwrap_or(cols[0]).trim();
        let msg_type = cols[2].trim().to_ascii_lowercase();
        let msg_text = cols[3].trim().to_ascii_lowercase();
        let damaged = msg_type == "error"
            || (msg_type == "status" && msg_text != "ok" && !msg_text.contains("up to date"))
            || msg_text.contains("crashed")
            || msg_text.contains("corrupt");
        if damaged && !table.is_empty() {
            bad.insert(table.to_string());
        }
    }
    bad.into_iter().collect()
}

fn quote_tables(tables: &[String]) -> String {
    tables
        .iter()
        .map(|t| format!("`{}`", t.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[Playbook(
    id = "database_repair",
    name = "Database table repair",
    description = "Finds crashed tables with CHECK TABLE, repairs them after a database dump, and re-verifies",
    tier = "infrastructure",
    priority = "high",
    symptoms = [
        "is marked as crashed",
        "should be repaired",
        "Table corrupt",
        "Incorrect key file",
        "Got error 145",
        "doesn't exist in engine"
    ]
)]
pub struct DatabaseRepairPlaybook {
    deps: Arc<PlaybookDeps>,
}

impl DatabaseRepairPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self { deps }
    }

    fn list_tables(&self, ctx: &FixContext, session: &Session<'_>) -> Result<Vec<String>> {
        let raw = session.exec_ok(&self.deps.wp(ctx, "db tables --all-tables-with-prefix"))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn query(&self, ctx: &FixContext, sql: &str) -> String {
        self.deps
            .wp(ctx, &format!("db query {} --skip-column-names", sh_quote(sql)))
    }

    fn check_tables(
        &self,
        ctx: &FixContext,
        session: &Session<'_>,
        run: &mut FixRun,
        tables: &[String],
        label: &str,
    ) -> Result<Vec<String>> {
        let out = run.probe(
            session,
            label,
            &self.query(ctx, &format!("CHECK TABLE {}", quote_tables(tables))),
        )?;
        if !out.success() {
            return Err(Error::Remote(format!("CHECK TABLE failed: {}", out.summary())));
        }
        Ok(damaged_tables(&out.stdout))
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;
        let tables = self.list_tables(ctx, &session)?;
        if tables.is_empty() {
            run.fail("no WordPress tables found");
            return Ok(());
        }
        let damaged = self.check_tables(ctx, &session, run, &tables, "check tables")?;
        run.observe(
            EvidenceType::DatabaseInfo,
            "damaged tables",
            if damaged.is_empty() {
                "none".to_string()
            } else {
                damaged.join("\n")
            },
        );
        if damaged.is_empty() {
            return Ok(());
        }

        let artifact = self.deps.backup_database(ctx, "table repair")?;
        run.backed_up(&artifact);

        let repair = self.query(ctx, &format!("REPAIR TABLE {}", quote_tables(&damaged)));
        let out = run.probe(&session, "repair tables", &repair)?;
        run.change(FixChange::command(
            format!("repaired {}", damaged.join(", ")),
            repair,
        ));
        if !out.success() {
            run.fail(format!("REPAIR TABLE failed: {}", out.summary()));
            return Ok(());
        }

        let remaining = self.check_tables(ctx, &session, run, &damaged, "re-check repaired tables")?;
        run.note("repaired_tables", json!(damaged));
        if !remaining.is_empty() {
            run.fail(format!("tables still damaged after repair: {}", remaining.join(", ")));
        }
        Ok(())
    }
}

impl FixPlaybook for DatabaseRepairPlaybook {
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
        let text = out.stdout.to_ascii_lowercase();
        Ok(text.contains("crashed") || text.contains("corrupt") || text.contains("should be repaired"))
    }

    fn hypothesis(&self, _ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, Self::matches_symptoms) {
            return "The collected errors report crashed tables; REPAIR TABLE on the affected tables restores them".into();
        }
        "wp db check flags tables as crashed or corrupt; repairing them prevents the site from failing on the next query".into()
    }

    fn apply(&self, ctx: &FixContext) -> FixResult {
        let mut run = FixRun::new(Self::ID);
        let outcome = self.fix(ctx, &mut run);
        run.finish(outcome)
    }
}

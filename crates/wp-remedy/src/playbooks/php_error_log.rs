use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use wp_remedy_macros::Playbook;

use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixResult, FixRun, PlaybookDeps,
    PlaybookInfo, RollbackAction, evidence_matches,
};
use crate::backup::ArtifactType;
use crate::error::Result;
use crate::evidence::EvidenceType;
use crate::remote::{Session, sh_quote};

const LOG_CANDIDATES: &[&str] = &["wp-content/debug.log", "error_log", "wp-admin/error_log"];

const MEMORY_LIMIT_FLOOR_MB: u64 = 256;
const MEMORY_LIMIT_CEILING_MB: u64 = 512;
const EXECUTION_TIME_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    MemoryExhausted,
    MaxExecutionTime,
    UndefinedFunction,
    SyntaxError,
    DatabaseError,
}

static PATTERNS: LazyLock<Vec<(ErrorPattern, Regex)>> = LazyLock::new(|| {
    [
        (ErrorPattern::MemoryExhausted, r"Allowed memory size of \d+ bytes exhausted"),
        (ErrorPattern::MaxExecutionTime, r"Maximum execution time of \d+ seconds? exceeded"),
        (ErrorPattern::UndefinedFunction, r"Call to undefined function [\w\\]+\(\)"),
        (ErrorPattern::SyntaxError, r"(?i)PHP Parse error|syntax error, unexpected"),
        (ErrorPattern::DatabaseError, r"WordPress database error"),
    ]
    .into_iter()
    .map(|(p, re)| (p, Regex::new(re).expect("built-in php log pattern")))
    .collect()
});

static PLUGIN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"wp-content/plugins/([A-Za-z0-9._-]+)/").expect("plugin path pattern"));

pub fn classify_line(line: &str) -> Option<ErrorPattern> {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(line))
        .map(|(p, _)| *p)
}

/// Pattern counts over a log excerpt.
pub fn classify_log(text: &str) -> BTreeMap<ErrorPattern, usize> {
    let mut counts = BTreeMap::new();
    for line in text.lines() {
        if let Some(p) = classify_line(line) {
            *counts.entry(p).or_insert(0) += 1;
        }
    }
    counts
}

/// Plugin slugs named in log paths, with mention counts.
pub fn plugin_mentions(text: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for caps in PLUGIN_PATH.captures_iter(text) {
        *counts.entry(caps[1].to_string()).or_insert(0) += 1;
    }
    counts
}

/// Parses values like `64M`, `1G`, `256`. Returns megabytes.
pub fn parse_memory_mb(raw: &str) -> Option<u64> {
    let raw = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    let (num, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len()));
    let n: u64 = num.parse().ok()?;
    match unit.trim().to_ascii_uppercase().as_str() {
        "" | "M" | "MB" => Some(n),
        "G" | "GB" => Some(n * 1024),
        "K" | "KB" => Some(n / 1024),
        _ => None,
    }
}

pub fn raised_memory_limit(current_mb: Option<u64>) -> u64 {
    let doubled = current_mb.map(|c| c * 2).unwrap_or(MEMORY_LIMIT_FLOOR_MB);
    doubled.clamp(MEMORY_LIMIT_FLOOR_MB, MEMORY_LIMIT_CEILING_MB)
}

/// First existing PHP error log under the WordPress root.
pub(crate) fn find_error_log(session: &Session<'_>, ctx: &FixContext) -> Result<Option<String>> {
    for rel in LOG_CANDIDATES {
        let path = ctx.wp_path(rel);
        if let Some(stat) = session.stat(&path)? {
            if !stat.is_dir {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

#[Playbook(
    id = "php_error_log",
    name = "PHP error log analysis",
    description = "Classifies recent PHP error log lines and applies the matching configuration fix",
    tier = "plugin_theme_conflicts",
    priority = "medium",
    symptoms = [
        "Allowed memory size",
        "Maximum execution time",
        "Call to undefined function",
        "PHP Parse error",
        "PHP Fatal error"
    ]
)]
pub struct PhpErrorLogPlaybook {
    deps: Arc<PlaybookDeps>,
    truncate_after_fix: bool,
}

impl PhpErrorLogPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self {
            deps,
            truncate_after_fix: true,
        }
    }

    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate_after_fix = truncate;
        self
    }

    fn tail(&self, session: &Session<'_>, path: &str) -> Result<String> {
        session.exec_ok(&format!(
            "tail -n {} {}",
            self.deps.evidence.settings().max_log_lines,
            sh_quote(path)
        ))
    }

    fn raise_memory_limit(&self, ctx: &FixContext, session: &Session<'_>, run: &mut FixRun) -> Result<()> {
        let out = session.exec(&self.deps.wp(ctx, "config get WP_MEMORY_LIMIT"))?;
        let current = if out.success() {
            parse_memory_mb(&out.stdout)
        } else {
            None
        };
        let target = raised_memory_limit(current);
        if current.is_some_and(|c| c >= target) {
            run.fail(format!(
                "WP_MEMORY_LIMIT is already {}M; memory exhaustion needs a code-level fix",
                current.unwrap_or_default()
            ));
            return Ok(());
        }
        let path = ctx.wp_config_path();
        let artifact = self
            .deps
            .backup_file(ctx, &path, ArtifactType::WpConfigBackup, "raise WP_MEMORY_LIMIT")?;
        run.backed_up(&artifact);
        let cmd = self
            .deps
            .wp(ctx, &format!("config set WP_MEMORY_LIMIT {target}M --type=constant"));
        run.mutate(
            session,
            FixChange::config(
                format!(
                    "raised WP_MEMORY_LIMIT from {} to {target}M",
                    current.map(|c| format!("{c}M")).unwrap_or_else(|| "default".into())
                ),
                path,
            ),
            &cmd,
        )?;
        Ok(())
    }

    fn raise_execution_time(&self, ctx: &FixContext, session: &Session<'_>, run: &mut FixRun) -> Result<()> {
        let ini = ctx.wp_path(".user.ini");
        let existing = session.stat(&ini)?;
        if existing.is_some() {
            let current = session.read_file(&ini)?;
            if current.contains("max_execution_time") {
                run.fail(format!("{ini} already sets max_execution_time"));
                return Ok(());
            }
            let artifact = self
                .deps
                .backup_file(ctx, &ini, ArtifactType::ConfigurationBackup, "raise max_execution_time")?;
            run.backed_up(&artifact);
        } else {
            run.undo_with(
                format!("remove {ini}"),
                RollbackAction::RemoveFile { path: ini.clone() },
            );
        }
        let append = format!(
            "printf '\\nmax_execution_time = {EXECUTION_TIME_SECS}\\n' >> {}",
            sh_quote(&ini)
        );
        run.mutate(
            session,
            FixChange::config(format!("set max_execution_time = {EXECUTION_TIME_SECS}"), ini),
            &append,
        )?;
        Ok(())
    }

    fn truncate_log(&self, ctx: &FixContext, session: &Session<'_>, run: &mut FixRun, log: &str) -> Result<()> {
        let artifact = match self
            .deps
            .backup_file(ctx, log, ArtifactType::FileBackup, "error log truncation")
        {
            Ok(a) => a,
            Err(e) => {
                // The fix itself already succeeded; keep the log.
                warn!(incident_id = %ctx.incident_id, log = %log, error = %e, "skipping log truncation");
                run.observe(EvidenceType::DiagnosticReport, "log truncation skipped", e.to_string());
                return Ok(());
            }
        };
        run.backed_up(&artifact);
        run.mutate(
            session,
            FixChange::file("truncated PHP error log", log),
            &format!(": > {}", sh_quote(log)),
        )?;
        Ok(())
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;
        let Some(log) = find_error_log(&session, ctx)? else {
            run.observe(EvidenceType::ErrorLog, "php error log", "no PHP error log found");
            return Ok(());
        };
        let excerpt = self.tail(&session, &log)?;
        let counts = classify_log(&excerpt);
        run.evidence(
            FixEvidence::new(EvidenceType::ErrorLog, "recent php error log", excerpt.as_str())
                .with_metadata(json!({ "path": log, "patterns": counts })),
        );
        // Ties resolve to the earlier pattern in declaration order.
        let Some(dominant) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(p, _)| *p)
        else {
            return Ok(());
        };
        run.note("dominant_pattern", json!(dominant));

        match dominant {
            ErrorPattern::MemoryExhausted => self.raise_memory_limit(ctx, &session, run)?,
            ErrorPattern::MaxExecutionTime => self.raise_execution_time(ctx, &session, run)?,
            ErrorPattern::UndefinedFunction | ErrorPattern::SyntaxError => {
                let plugins = plugin_mentions(&excerpt);
                run.observe(
                    EvidenceType::DiagnosticReport,
                    "code-level error",
                    format!(
                        "{dominant:?} errors point at code; implicated plugins: {}",
                        plugins.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                );
                run.fail("code-level PHP errors need the plugin conflict playbook or a developer");
            }
            ErrorPattern::DatabaseError => {
                run.observe(
                    EvidenceType::DiagnosticReport,
                    "database errors",
                    "WordPress database errors dominate the log; database repair is the next step",
                );
                run.fail("database errors are handled by the database playbooks");
            }
        }

        if self.truncate_after_fix && run.has_changes() && !run.has_failed() {
            self.truncate_log(ctx, &session, run, &log)?;
        }
        Ok(())
    }
}

impl FixPlaybook for PhpErrorLogPlaybook {
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
        let Some(log) = find_error_log(&session, ctx)? else {
            return Ok(false);
        };
        Ok(!classify_log(&self.tail(&session, &log)?).is_empty())
    }

    fn hypothesis(&self, _ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, |t| t.contains("Allowed memory size")) {
            return "PHP runs out of memory; raising WP_MEMORY_LIMIT lets requests complete".into();
        }
        if evidence_matches(evidence, |t| t.contains("Maximum execution time")) {
            return "Requests hit the PHP execution time limit; raising it lets long requests finish".into();
        }
        "Recent PHP errors share a recognizable pattern with a known configuration fix".into()
    }

    fn apply(&self, ctx: &FixContext) -> FixResult {
        let mut run = FixRun::new(Self::ID);
        let outcome = self.fix(ctx, &mut run);
        run.finish(outcome)
    }
}

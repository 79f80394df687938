//! Remediation playbooks.
//!
//! A playbook is a small state machine: `can_apply` decides whether it is
//! relevant, `apply` backs up, mutates and verifies, and the returned
//! [`RollbackPlan`] undoes the mutation when something later goes wrong.
//! `apply` never returns an error; failures are folded into the
//! [`FixResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::evidence::EvidenceType;
use crate::signature::{self, SignatureAlgorithm};

pub mod core_integrity;
pub mod database_connection;
pub mod database_repair;
mod deps;
pub mod php_error_log;
pub mod plugin_conflict;
mod registry;
mod run;
pub mod wp_config;

pub use deps::PlaybookDeps;
pub use registry::PlaybookRegistry;
pub use run::FixRun;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Tier1Infrastructure,
    Tier2CoreIntegrity,
    Tier3PluginThemeConflicts,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier1Infrastructure => "TIER_1_INFRASTRUCTURE",
            Self::Tier2CoreIntegrity => "TIER_2_CORE_INTEGRITY",
            Self::Tier3PluginThemeConflicts => "TIER_3_PLUGIN_THEME_CONFLICTS",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared most urgent first, so the derived `Ord` sorts `Critical` first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PlaybookInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub tier: Tier,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixContext {
    pub incident_id: String,
    pub site_id: String,
    pub server_id: String,
    pub site_path: String,
    pub wordpress_path: String,
    pub domain: String,
    pub correlation_id: String,
    pub trace_id: String,
}

impl FixContext {
    pub fn new(
        incident_id: impl Into<String>,
        site_id: impl Into<String>,
        server_id: impl Into<String>,
        wordpress_path: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let wordpress_path = wordpress_path.into();
        Self {
            incident_id: incident_id.into(),
            site_id: site_id.into(),
            server_id: server_id.into(),
            site_path: wordpress_path.clone(),
            wordpress_path,
            domain: domain.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn wp_path(&self, rel: &str) -> String {
        format!(
            "{}/{}",
            self.wordpress_path.trim_end_matches('/'),
            rel.trim_start_matches('/')
        )
    }

    pub fn wp_config_path(&self) -> String {
        self.wp_path("wp-config.php")
    }
}

/// One observation made during a playbook run, signed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixEvidence {
    pub evidence_type: EvidenceType,
    pub description: String,
    pub content: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl FixEvidence {
    pub fn new(
        evidence_type: EvidenceType,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            evidence_type,
            description: description.into(),
            signature: signature::sign(&content, SignatureAlgorithm::Sha256).hash,
            content,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    File,
    Command,
    Config,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixChange {
    pub change_type: ChangeType,
    pub description: String,
    pub path: Option<String>,
    pub command: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FixChange {
    pub fn file(description: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::File,
            description: description.into(),
            path: Some(path.into()),
            command: None,
            timestamp: Utc::now(),
        }
    }

    pub fn config(description: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Config,
            ..Self::file(description, path)
        }
    }

    pub fn command(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Command,
            description: description.into(),
            path: None,
            command: Some(command.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackAction {
    RestoreBackup { artifact_id: String },
    RunCommand { command: String },
    ActivatePlugins { plugins: Vec<String> },
    RemoveFile { path: String },
}

impl RollbackAction {
    pub fn step_type(&self) -> &'static str {
        match self {
            Self::RestoreBackup { .. } => "restore_backup",
            Self::RunCommand { .. } => "run_command",
            Self::ActivatePlugins { .. } => "activate_plugins",
            Self::RemoveFile { .. } => "remove_file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackStep {
    pub order: u32,
    pub step_type: String,
    pub description: String,
    pub action: RollbackAction,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Default for RollbackPlan {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

impl RollbackPlan {
    /// Appends a step; later steps get higher `order` and run first.
    pub fn push(&mut self, description: impl Into<String>, action: RollbackAction) -> &mut RollbackStep {
        let order = self.steps.iter().map(|s| s.order).max().unwrap_or(0) + 1;
        self.steps.push(RollbackStep {
            order,
            step_type: action.step_type().to_string(),
            description: description.into(),
            action,
            parameters: BTreeMap::new(),
        });
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in execution order: descending `order`.
    pub fn execution_order(&self) -> Vec<&RollbackStep> {
        let mut steps: Vec<&RollbackStep> = self.steps.iter().collect();
        steps.sort_by(|a, b| b.order.cmp(&a.order));
        steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    pub success: bool,
    /// False means nothing on the remote host was changed.
    pub applied: bool,
    pub changes: Vec<FixChange>,
    pub evidence: Vec<FixEvidence>,
    pub rollback_plan: Option<RollbackPlan>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub error: Option<String>,
}

pub trait FixPlaybook: Send + Sync {
    fn info(&self) -> PlaybookInfo;

    fn deps(&self) -> &PlaybookDeps;

    /// Reactive when `evidence` carries a known symptom, otherwise a cheap
    /// probe of the remote host.
    fn can_apply(&self, ctx: &FixContext, evidence: &[FixEvidence]) -> Result<bool>;

    fn hypothesis(&self, ctx: &FixContext, evidence: &[FixEvidence]) -> String;

    fn apply(&self, ctx: &FixContext) -> FixResult;

    /// Runs the plan's steps from highest `order` down; stops at the first
    /// failing step.
    fn rollback(&self, ctx: &FixContext, plan: &RollbackPlan) -> bool {
        let playbook = self.info().id;
        for step in plan.execution_order() {
            match self.deps().execute_rollback_step(ctx, step) {
                Ok(()) => {
                    info!(playbook, incident_id = %ctx.incident_id, order = step.order, step = %step.description, "rollback step done");
                }
                Err(e) => {
                    error!(playbook, incident_id = %ctx.incident_id, order = step.order, step = %step.description, error = %e, "rollback step failed");
                    return false;
                }
            }
        }
        if plan.is_empty() {
            warn!(playbook, incident_id = %ctx.incident_id, "rollback requested with an empty plan");
        }
        true
    }
}

/// Case-insensitive symptom search across evidence descriptions and content.
pub(crate) fn evidence_matches(evidence: &[FixEvidence], matches: impl Fn(&str) -> bool) -> bool {
    evidence
        .iter()
        .any(|e| matches(&e.content) || matches(&e.description))
}

pub fn builtin_playbooks(deps: Arc<PlaybookDeps>) -> Vec<Box<dyn FixPlaybook>> {
    vec![
        Box::new(database_connection::DatabaseConnectionPlaybook::new(deps.clone())),
        Box::new(database_repair::DatabaseRepairPlaybook::new(deps.clone())),
        Box::new(core_integrity::CoreIntegrityPlaybook::new(deps.clone())),
        Box::new(wp_config::WpConfigPlaybook::new(deps.clone())),
        Box::new(php_error_log::PhpErrorLogPlaybook::new(deps.clone())),
        Box::new(plugin_conflict::PluginConflictPlaybook::new(deps)),
    ]
}

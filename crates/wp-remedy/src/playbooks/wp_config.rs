use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use wp_remedy_macros::Playbook;

use super::{
    FixChange, FixContext, FixEvidence, FixPlaybook, FixRun, PlaybookDeps, PlaybookInfo,
    evidence_matches,
};
use crate::backup::ArtifactType;
use crate::error::{Error, Result};
use crate::evidence::EvidenceType;
use crate::remote::sh_quote;
use crate::signature::{self, SignatureAlgorithm};

pub const REQUIRED_CONSTANTS: &[&str] = &["DB_NAME", "DB_USER", "DB_PASSWORD", "DB_HOST"];

pub const SECURITY_KEYS: &[&str] = &[
    "AUTH_KEY",
    "SECURE_AUTH_KEY",
    "LOGGED_IN_KEY",
    "NONCE_KEY",
    "AUTH_SALT",
    "SECURE_AUTH_SALT",
    "LOGGED_IN_SALT",
    "NONCE_SALT",
];

// Shipped in wp-config-sample.php.
const PLACEHOLDER: &str = "put your unique phrase here";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigAudit {
    pub missing_constants: Vec<String>,
    /// Security keys that are absent, empty or still the sample placeholder.
    pub weak_keys: Vec<String>,
}

impl ConfigAudit {
    pub fn is_clean(&self) -> bool {
        self.missing_constants.is_empty() && self.weak_keys.is_empty()
    }
}

fn define_value(content: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r#"define\(\s*['"]{}['"]\s*,\s*(?:'([^']*)'|"([^"]*)"|([^)\s]+))"#,
        regex::escape(name)
    ))
    .ok()?;
    let caps = re.captures(content)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().to_string())
}

/// Checks the database constants and the eight security keys.
pub fn audit_config(content: &str) -> ConfigAudit {
    let missing_constants = REQUIRED_CONSTANTS
        .iter()
        .filter(|c| define_value(content, c).is_none())
        .map(|c| c.to_string())
        .collect();
    let weak_keys = SECURITY_KEYS
        .iter()
        .filter(|k| match define_value(content, k) {
            None => true,
            Some(v) => v.trim().is_empty() || v.contains(PLACEHOLDER),
        })
        .map(|k| k.to_string())
        .collect();
    ConfigAudit {
        missing_constants,
        weak_keys,
    }
}

fn generate_secret() -> String {
    let mut seed = Vec::with_capacity(32);
    seed.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    seed.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    signature::digest(&seed, SignatureAlgorithm::Sha256)
}

// Group or world writable.
fn too_permissive(mode: &str) -> bool {
    let digits: Vec<u32> = mode.chars().filter_map(|c| c.to_digit(8)).collect();
    match digits.as_slice() {
        [.., g, o] => g & 2 != 0 || o & 2 != 0,
        _ => false,
    }
}

#[Playbook(
    id = "wp_config",
    name = "wp-config.php validation",
    description = "Checks required constants and security keys in wp-config.php and regenerates missing keys",
    tier = "core_integrity",
    priority = "high",
    symptoms = [
        "wp-config.php",
        "security keys",
        "AUTH_KEY",
        "Undefined constant \"DB_",
        "put your unique phrase here"
    ]
)]
pub struct WpConfigPlaybook {
    deps: Arc<PlaybookDeps>,
}

impl WpConfigPlaybook {
    pub fn new(deps: Arc<PlaybookDeps>) -> Self {
        Self { deps }
    }

    fn fix(&self, ctx: &FixContext, run: &mut FixRun) -> Result<()> {
        let session = self.deps.session(ctx)?;
        let path = ctx.wp_config_path();
        let stat = session
            .stat(&path)?
            .ok_or_else(|| Error::msg(format!("{path} not found")))?;
        let content = session.read_file(&path)?;
        let audit = audit_config(&content);
        run.evidence(
            FixEvidence::new(
                EvidenceType::WordpressInfo,
                "wp-config.php audit",
                format!(
                    "missing constants: [{}]\nweak security keys: [{}]\npermissions: {}",
                    audit.missing_constants.join(", "),
                    audit.weak_keys.join(", "),
                    stat.permissions
                ),
            )
            .with_metadata(json!({
                "path": path,
                "missing_constants": audit.missing_constants,
                "weak_keys": audit.weak_keys,
                "permissions": stat.permissions,
            })),
        );

        if !audit.missing_constants.is_empty() {
            run.fail(format!(
                "wp-config.php lacks database constants ({}); credentials cannot be regenerated",
                audit.missing_constants.join(", ")
            ));
            return Ok(());
        }
        let loosen = too_permissive(&stat.permissions);
        if audit.weak_keys.is_empty() && !loosen {
            return Ok(());
        }

        let artifact = self
            .deps
            .backup_file(ctx, &path, ArtifactType::WpConfigBackup, "wp-config repair")?;
        run.backed_up(&artifact);

        for key in &audit.weak_keys {
            // The secret only ever appears in the executed command.
            let set = |value: &str| {
                self.deps
                    .wp(ctx, &format!("config set {key} {value} --type=constant"))
            };
            run.mutate_shown(
                &session,
                FixChange::config(format!("regenerated {key}"), path.clone()),
                &set(&sh_quote(&generate_secret())),
                &set("'[REDACTED]'"),
            )?;
        }
        if loosen {
            run.mutate(
                &session,
                FixChange::file(
                    format!("tightened permissions from {} to 640", stat.permissions),
                    path.clone(),
                ),
                &format!("chmod 640 {}", sh_quote(&path)),
            )?;
        }

        let after = audit_config(&session.read_file(&path)?);
        if !after.weak_keys.is_empty() {
            run.fail(format!(
                "security keys still missing after regeneration: {}",
                after.weak_keys.join(", ")
            ));
            return Ok(());
        }
        let check = run.probe(&session, "database connection test", &self.deps.wp(ctx, "db check"))?;
        if !check.success() {
            run.fail(format!("database connection test failed: {}", check.summary()));
        }
        run.note("regenerated_keys", audit.weak_keys.len());
        Ok(())
    }
}

impl FixPlaybook for WpConfigPlaybook {
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
        let path = ctx.wp_config_path();
        if !session.exists(&path)? {
            return Ok(false);
        }
        let audit = audit_config(&session.read_file(&path)?);
        Ok(audit.missing_constants.is_empty() && !audit.weak_keys.is_empty())
    }

    fn hypothesis(&self, ctx: &FixContext, evidence: &[FixEvidence]) -> String {
        if evidence_matches(evidence, Self::matches_symptoms) {
            return format!(
                "The collected errors point at {}; regenerating its security keys restores a valid configuration",
                ctx.wp_config_path()
            );
        }
        format!(
            "{} is missing security keys or uses placeholder values; regenerating them restores a valid configuration",
            ctx.wp_config_path()
        )
    }

    fn apply(&self, ctx: &FixContext) -> super::FixResult {
        let mut run = FixRun::new(Self::ID);
        let outcome = self.fix(ctx, &mut run);
        run.finish(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?php
define( 'DB_NAME', 'wordpress' );
define( 'DB_USER', 'wp' );
define( 'DB_PASSWORD', 'secret' );
define( 'DB_HOST', "localhost" );
define( 'AUTH_KEY',         'put your unique phrase here' );
define( 'SECURE_AUTH_KEY',  'a1' );
define( 'LOGGED_IN_KEY',    'a2' );
define( 'NONCE_KEY',        'a3' );
define( 'AUTH_SALT',        'a4' );
define( 'SECURE_AUTH_SALT', 'a5' );
define( 'LOGGED_IN_SALT',   '' );
$table_prefix = 'wp_';
"#;

    #[test]
    fn audit_finds_placeholder_empty_and_absent_keys() {
        let audit = audit_config(SAMPLE);
        assert!(audit.missing_constants.is_empty());
        assert_eq!(audit.weak_keys, vec!["AUTH_KEY", "LOGGED_IN_SALT", "NONCE_SALT"]);
        assert!(!audit.is_clean());
    }

    #[test]
    fn audit_reports_missing_db_constants() {
        let audit = audit_config("<?php define('DB_NAME', 'x');");
        assert_eq!(audit.missing_constants, vec!["DB_USER", "DB_PASSWORD", "DB_HOST"]);
    }

    #[test]
    fn generated_secrets_are_unique_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn permission_check_flags_writable_modes() {
        assert!(too_permissive("666"));
        assert!(too_permissive("664"));
        assert!(!too_permissive("644"));
        assert!(!too_permissive("640"));
        assert!(!too_permissive("400"));
    }

    #[test]
    fn symptoms_match_case_insensitively() {
        assert!(WpConfigPlaybook::matches_symptoms("Missing AUTH_key in config"));
        assert!(!WpConfigPlaybook::matches_symptoms("nothing to see"));
        assert_eq!(WpConfigPlaybook::TIER, super::super::Tier::Tier2CoreIntegrity);
    }
}

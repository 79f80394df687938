use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    FileBackup,
    DirectoryBackup,
    PluginBackup,
    ThemeBackup,
    DatabaseBackup,
    ConfigurationBackup,
    WordpressCoreBackup,
    HtaccessBackup,
    WpConfigBackup,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileBackup => "FILE_BACKUP",
            Self::DirectoryBackup => "DIRECTORY_BACKUP",
            Self::PluginBackup => "PLUGIN_BACKUP",
            Self::ThemeBackup => "THEME_BACKUP",
            Self::DatabaseBackup => "DATABASE_BACKUP",
            Self::ConfigurationBackup => "CONFIGURATION_BACKUP",
            Self::WordpressCoreBackup => "WORDPRESS_CORE_BACKUP",
            Self::HtaccessBackup => "HTACCESS_BACKUP",
            Self::WpConfigBackup => "WP_CONFIG_BACKUP",
        }
    }

    // Short form used in local file names.
    pub(crate) fn slug(self) -> &'static str {
        match self {
            Self::FileBackup => "file",
            Self::DirectoryBackup => "dir",
            Self::PluginBackup => "plugin",
            Self::ThemeBackup => "theme",
            Self::DatabaseBackup => "db",
            Self::ConfigurationBackup => "config",
            Self::WordpressCoreBackup => "core",
            Self::HtaccessBackup => "htaccess",
            Self::WpConfigBackup => "wpconfig",
        }
    }

    /// Whether artifacts of this type hold a tar.gz of a directory.
    pub fn is_archive(self) -> bool {
        matches!(
            self,
            Self::DirectoryBackup | Self::PluginBackup | Self::ThemeBackup | Self::WordpressCoreBackup
        )
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `WP_CONFIG_BACKUP` as well as `wp-config-backup`.
impl std::str::FromStr for ArtifactType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let norm = s.trim().replace('-', "_").to_ascii_uppercase();
        serde_json::from_value(Value::String(norm))
            .map_err(|_| crate::Error::msg(format!("unknown artifact type '{s}'")))
    }
}

/// Known metadata fields plus an open `extra` map for anything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollback_hints: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl BackupMetadata {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            backup_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Caller metadata wins except for the collector-derived fields, which
    /// always come from what was observed on the remote host.
    pub(crate) fn merge_collected(mut self, collected: CollectedFacts) -> Self {
        self.original_permissions = collected.permissions;
        self.original_owner = collected.owner;
        self.original_group = collected.group;
        self.original_size = collected.original_size;
        self.compression_ratio = collected.compression_ratio;
        self.server_id = Some(collected.server_id);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CollectedFacts {
    pub server_id: String,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub original_size: Option<u64>,
    pub compression_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupArtifact {
    pub id: String,
    pub incident_id: String,
    pub artifact_type: ArtifactType,
    pub local_path: PathBuf,
    pub original_path: String,
    /// Hex SHA-256 of the bytes at `local_path`.
    pub checksum: String,
    /// Persisted byte count (not the remote-reported size).
    pub size_bytes: u64,
    pub metadata: BackupMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOperationResult {
    pub success: bool,
    pub artifact: Option<BackupArtifact>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl BackupOperationResult {
    /// The created artifact, or the recorded failure as an error.
    pub fn into_artifact(self) -> crate::Result<BackupArtifact> {
        match (self.success, self.artifact) {
            (true, Some(a)) => Ok(a),
            _ => Err(crate::Error::Remote(
                self.error
                    .unwrap_or_else(|| "backup failed without an error message".into()),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub artifact_id: String,
    pub is_valid: bool,
    pub checksum_match: bool,
    pub file_exists: bool,
    pub size_match: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreFailure {
    pub artifact_id: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOperationResult {
    pub success: bool,
    pub incident_id: String,
    pub restored_files: Vec<String>,
    pub failed_files: Vec<String>,
    pub failures: Vec<RestoreFailure>,
    /// Artifact ids in the order they were processed (newest first).
    pub processed_artifacts: Vec<String>,
    pub execution_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_types_parse_from_cli_spelling() {
        assert_eq!("wp-config-backup".parse::<ArtifactType>().expect("parse"), ArtifactType::WpConfigBackup);
        assert_eq!("PLUGIN_BACKUP".parse::<ArtifactType>().expect("parse"), ArtifactType::PluginBackup);
        assert!("tarball".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn collector_fields_override_caller_metadata() {
        let caller = BackupMetadata {
            original_permissions: Some("777".into()),
            backup_reason: Some("pre-fix".into()),
            fix_attempt: Some(2),
            ..Default::default()
        }
        .with_extra("ticket", "OPS-1");
        let merged = caller.merge_collected(CollectedFacts {
            server_id: "srv".into(),
            permissions: Some("644".into()),
            owner: Some("www-data".into()),
            group: Some("www-data".into()),
            ..Default::default()
        });
        assert_eq!(merged.original_permissions.as_deref(), Some("644"));
        assert_eq!(merged.backup_reason.as_deref(), Some("pre-fix"));
        assert_eq!(merged.fix_attempt, Some(2));
        assert_eq!(merged.extra_str("ticket"), Some("OPS-1"));
        assert_eq!(merged.server_id.as_deref(), Some("srv"));
    }

    #[test]
    fn artifact_type_serializes_screaming_snake() {
        let s = serde_json::to_string(&ArtifactType::WpConfigBackup).expect("encode");
        assert_eq!(s, "\"WP_CONFIG_BACKUP\"");
        assert!(ArtifactType::PluginBackup.is_archive());
        assert!(!ArtifactType::HtaccessBackup.is_archive());
    }
}

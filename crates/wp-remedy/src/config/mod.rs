use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::remote::ssh::SshServerConfig;
use crate::signature::SignatureAlgorithm;

pub const DEFAULT_MAX_BACKUP_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
pub const DEFAULT_MAX_LOG_LINES: usize = 1000;
pub const DEFAULT_FULL_READ_MAX_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_str(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.value_path(path).and_then(Value::as_table).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::Config(format!("failed to deserialize '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: "var/wp-remedy".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backup_bytes: u64,
    // Relative to the store root unless absolute.
    pub local_dir: String,
    pub remote_temp_dir: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backup_bytes: DEFAULT_MAX_BACKUP_BYTES,
            local_dir: "backups/files".into(),
            remote_temp_dir: "/tmp".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
    pub max_log_lines: usize,
    pub full_read_max_bytes: u64,
    pub signature_algorithm: SignatureAlgorithm,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            full_read_max_bytes: DEFAULT_FULL_READ_MAX_BYTES,
            signature_algorithm: SignatureAlgorithm::Sha256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            transfer_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    pub scheme: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            scheme: "https".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub backup: BackupConfig,
    pub evidence: EvidenceConfig,
    pub remote: RemoteConfig,
    pub probe: ProbeConfig,
    pub servers: BTreeMap<String, SshServerConfig>,
}

impl EngineConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg = Self {
            store: doc.deserialize_path("store")?.unwrap_or_default(),
            backup: doc.deserialize_path("backup")?.unwrap_or_default(),
            evidence: doc.deserialize_path("evidence")?.unwrap_or_default(),
            remote: doc.deserialize_path("remote")?.unwrap_or_default(),
            probe: doc.deserialize_path("probe")?.unwrap_or_default(),
            servers: doc.deserialize_path("servers")?.unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.backup.max_backup_bytes == 0 {
            return Err(Error::Config("backup.max_backup_bytes must be > 0".into()));
        }
        if self.remote.command_timeout_secs == 0 {
            return Err(Error::Config(
                "remote.command_timeout_secs must be > 0".into(),
            ));
        }
        if self.evidence.max_log_lines == 0 {
            return Err(Error::Config("evidence.max_log_lines must be > 0".into()));
        }
        if !self.backup.remote_temp_dir.starts_with('/') {
            return Err(Error::Config(format!(
                "backup.remote_temp_dir must be absolute, got '{}'",
                self.backup.remote_temp_dir
            )));
        }
        Ok(())
    }

    pub fn store_root(&self, base: &Path) -> PathBuf {
        resolve_ref_path(base, &self.store.root_dir)
    }

    pub fn backup_dir(&self, base: &Path) -> PathBuf {
        let root = self.store_root(base);
        let p = PathBuf::from(&self.backup.local_dir);
        if p.is_absolute() { p } else { root.join(p) }
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

// Relative references resolve against the directory of the referring file.
fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        return p;
    }
    let base = if from_file.is_dir() {
        from_file
    } else {
        from_file.parent().unwrap_or_else(|| Path::new("."))
    };
    base.join(p)
}

fn string_list(path: &Path, v: &Value, key: &str) -> Result<Vec<String>> {
    let Some(arr) = v.as_array() else {
        return Err(Error::Config(format!(
            "'{key}' in {} must be an array of strings",
            path.display()
        )));
    };
    arr.iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "invalid '{key}' entry in {} (expected string)",
                        path.display()
                    ))
                })
        })
        .filter(|r| r.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
        .collect()
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::Config(format!(
            "config include cycle at {}",
            canonical.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let (extends, imports) = match value.as_table_mut() {
        Some(tbl) => (tbl.remove("extends"), tbl.remove("imports")),
        None => (None, None),
    };

    if let Some(ext) = extends {
        let ext = ext.as_str().ok_or_else(|| {
            Error::Config(format!("'extends' in {} must be a string", path.display()))
        })?;
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(imports) = imports {
        for imp in string_list(path, &imports, "imports")? {
            let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
            merge_values(&mut out, loaded);
        }
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_missing() {
        let doc = ConfigDoc::from_str("engine.toml", "").expect("parse");
        let cfg = EngineConfig::from_doc(&doc).expect("cfg");
        assert_eq!(cfg.backup.max_backup_bytes, DEFAULT_MAX_BACKUP_BYTES);
        assert_eq!(cfg.evidence.compression_threshold_bytes, 1024);
        assert!(cfg.evidence.compression_enabled);
        assert_eq!(cfg.remote.command_timeout_secs, 30);
        assert_eq!(cfg.evidence.signature_algorithm, SignatureAlgorithm::Sha256);
    }

    #[test]
    fn sections_override_defaults() {
        let doc = ConfigDoc::from_str(
            "engine.toml",
            r#"
[backup]
max_backup_bytes = 2048

[evidence]
compression_enabled = false
signature_algorithm = "sha512"

[servers.web1]
target = "deploy@web1.example.com"
port = 2222
"#,
        )
        .expect("parse");
        let cfg = EngineConfig::from_doc(&doc).expect("cfg");
        assert_eq!(cfg.backup.max_backup_bytes, 2048);
        assert!(!cfg.evidence.compression_enabled);
        assert_eq!(cfg.evidence.signature_algorithm, SignatureAlgorithm::Sha512);
        assert_eq!(cfg.servers["web1"].port, Some(2222));
    }

    #[test]
    fn rejects_zero_timeout() {
        let doc = ConfigDoc::from_str("engine.toml", "[remote]\ncommand_timeout_secs = 0\n")
            .expect("parse");
        assert!(EngineConfig::from_doc(&doc).is_err());
    }

    #[test]
    fn extends_and_imports_merge_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[backup]\nmax_backup_bytes = 10\n[remote]\ncommand_timeout_secs = 5\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("servers.toml"),
            "[servers.a]\ntarget = \"root@a\"\n",
        )
        .expect("write servers");
        fs::write(
            tmp.path().join("engine.toml"),
            "extends = \"base.toml\"\nimports = [\"servers.toml\"]\n[backup]\nmax_backup_bytes = 20\n",
        )
        .expect("write engine");

        let doc = load(&tmp.path().join("engine.toml")).expect("load");
        let cfg = EngineConfig::from_doc(&doc).expect("cfg");
        assert_eq!(cfg.backup.max_backup_bytes, 20);
        assert_eq!(cfg.remote.command_timeout_secs, 5);
        assert!(cfg.servers.contains_key("a"));
    }

    #[test]
    fn include_cycle_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("b");
        let err = load(&tmp.path().join("a.toml")).expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }
}

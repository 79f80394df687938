//! Signed, redacted and optionally compressed evidence records.
//!
//! Content is redacted first, then signed as plaintext, then (above the
//! configured threshold) stored as base64 of gzip. Reads decode
//! transparently, so callers only ever see the signed plaintext.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audit::{self, AuditEvent, AuditLog};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::redact::Redactor;
use crate::remote::RemoteChannel;
use crate::signature::{self, Signature, SignatureAlgorithm};
use crate::store::ArtifactStore;

mod collect;
pub mod compress;
mod search;

pub use collect::{CommandOutputCapture, LogCollectionResult};
pub use search::{DEFAULT_SEARCH_LIMIT, EvidenceFilter, EvidenceSearchResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceType {
    LogFile,
    CommandOutput,
    SystemInfo,
    WordpressInfo,
    ErrorLog,
    AccessLog,
    DiagnosticReport,
    PhpInfo,
    DatabaseInfo,
}

impl EvidenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogFile => "LOG_FILE",
            Self::CommandOutput => "COMMAND_OUTPUT",
            Self::SystemInfo => "SYSTEM_INFO",
            Self::WordpressInfo => "WORDPRESS_INFO",
            Self::ErrorLog => "ERROR_LOG",
            Self::AccessLog => "ACCESS_LOG",
            Self::DiagnosticReport => "DIAGNOSTIC_REPORT",
            Self::PhpInfo => "PHP_INFO",
            Self::DatabaseInfo => "DATABASE_INFO",
        }
    }

    /// Classifies a log path by name.
    pub fn for_log_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
        if name.contains("access") {
            Self::AccessLog
        } else if name.contains("error") || name.contains("debug") {
            Self::ErrorLog
        } else {
            Self::LogFile
        }
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvidenceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.trim().to_ascii_uppercase()))
            .map_err(|_| Error::msg(format!("unknown evidence type '{s}'")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceMetadata {
    pub collection_time: Option<DateTime<Utc>>,
    pub collection_id: Option<String>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    pub compressed: bool,
    /// Plaintext byte length.
    pub original_size: Option<usize>,
    pub compressed_size: Option<usize>,
    pub compression_ratio: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl EvidenceMetadata {
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRecord {
    pub id: String,
    pub incident_id: String,
    pub evidence_type: EvidenceType,
    /// `"<algorithm>:<hex>"` over the plaintext content.
    pub signature: String,
    /// Plaintext, or base64 of gzip when `metadata.compressed`.
    pub content: String,
    pub metadata: EvidenceMetadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub max_log_lines: usize,
    pub full_read_max_bytes: u64,
    pub signature_algorithm: SignatureAlgorithm,
    pub command_timeout: Duration,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EvidenceSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            compression_enabled: cfg.evidence.compression_enabled,
            compression_threshold: cfg.evidence.compression_threshold_bytes,
            max_log_lines: cfg.evidence.max_log_lines,
            full_read_max_bytes: cfg.evidence.full_read_max_bytes,
            signature_algorithm: cfg.evidence.signature_algorithm,
            command_timeout: Duration::from_secs(cfg.remote.command_timeout_secs),
        }
    }
}

pub struct EvidenceRecorder {
    store: Arc<dyn ArtifactStore>,
    channel: Arc<dyn RemoteChannel>,
    audit: Arc<dyn AuditLog>,
    redactor: Arc<dyn Redactor>,
    settings: EvidenceSettings,
}

fn redact_value(redactor: &dyn Redactor, v: &mut Value) {
    match v {
        Value::String(s) => *s = redactor.redact_text(s),
        Value::Array(items) => items.iter_mut().for_each(|i| redact_value(redactor, i)),
        Value::Object(map) => map.values_mut().for_each(|i| redact_value(redactor, i)),
        _ => {}
    }
}

impl EvidenceRecorder {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        channel: Arc<dyn RemoteChannel>,
        audit: Arc<dyn AuditLog>,
        redactor: Arc<dyn Redactor>,
        settings: EvidenceSettings,
    ) -> Self {
        Self {
            store,
            channel,
            audit,
            redactor,
            settings,
        }
    }

    pub fn settings(&self) -> &EvidenceSettings {
        &self.settings
    }

    pub fn generate_signature(&self, content: &str, algorithm: Option<SignatureAlgorithm>) -> Signature {
        signature::sign(content, algorithm.unwrap_or(self.settings.signature_algorithm))
    }

    pub fn store_evidence(
        &self,
        incident_id: &str,
        evidence_type: EvidenceType,
        content: &str,
        metadata: EvidenceMetadata,
    ) -> Result<EvidenceRecord> {
        let plaintext = self.redactor.redact_text(content);
        let alg = self.settings.signature_algorithm;
        let sig = signature::sign(&plaintext, alg);

        let mut meta = metadata;
        for v in meta.extra.values_mut() {
            redact_value(self.redactor.as_ref(), v);
        }
        meta.collection_time = Some(Utc::now());
        meta.collection_id = Some(uuid::Uuid::new_v4().to_string());
        meta.signature_algorithm = Some(alg);
        meta.original_size = Some(plaintext.len());
        meta.compressed = false;
        meta.compressed_size = None;
        meta.compression_ratio = None;

        let mut stored = plaintext;
        if self.settings.compression_enabled && stored.len() > self.settings.compression_threshold {
            match compress::encode(&stored) {
                Ok(enc) => {
                    meta.compressed = true;
                    meta.compressed_size = Some(enc.len());
                    meta.compression_ratio = Some(enc.len() as f64 / stored.len() as f64);
                    stored = enc;
                }
                Err(e) => {
                    warn!(incident_id = %incident_id, error = %e, "evidence compression failed, storing plaintext");
                }
            }
        }

        let record = EvidenceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            evidence_type,
            signature: sig.hash,
            content: stored,
            metadata: meta,
            timestamp: Utc::now(),
        };
        self.store.create_evidence(&record)?;
        info!(
            incident_id = %incident_id,
            evidence_id = %record.id,
            evidence_type = %evidence_type,
            compressed = record.metadata.compressed,
            "evidence stored"
        );
        self.audit.log_event(AuditEvent::new(
            audit::EVIDENCE_STORED,
            "evidence",
            record.id.clone(),
            json!({
                "incident_id": incident_id,
                "evidence_type": evidence_type,
                "signature": record.signature,
                "compressed": record.metadata.compressed,
            }),
        ));
        Ok(record)
    }

    /// The record with its content decoded back to plaintext.
    pub fn get_evidence_by_id(&self, evidence_id: &str) -> Result<EvidenceRecord> {
        let record = self
            .store
            .find_evidence(evidence_id)?
            .ok_or_else(|| Error::not_found("evidence", evidence_id))?;
        Ok(decoded(record))
    }

    pub fn verify_evidence_signature(&self, evidence_id: &str) -> Result<bool> {
        let record = self.get_evidence_by_id(evidence_id)?;
        Ok(signature::verify(&record.content, &record.signature))
    }

    pub fn delete_evidence(&self, evidence_id: &str) -> Result<()> {
        let record = self
            .store
            .find_evidence(evidence_id)?
            .ok_or_else(|| Error::not_found("evidence", evidence_id))?;
        self.store.delete_evidence(evidence_id)?;
        self.audit.log_event(AuditEvent::new(
            audit::EVIDENCE_DELETED,
            "evidence",
            evidence_id,
            json!({ "incident_id": record.incident_id, "evidence_type": record.evidence_type }),
        ));
        Ok(())
    }
}

pub(crate) fn decoded(mut record: EvidenceRecord) -> EvidenceRecord {
    if !record.metadata.compressed {
        return record;
    }
    match compress::decode(&record.content) {
        Ok(plain) => record.content = plain,
        Err(e) => {
            warn!(evidence_id = %record.id, error = %e, "evidence decompression failed, returning stored content");
        }
    }
    record
}

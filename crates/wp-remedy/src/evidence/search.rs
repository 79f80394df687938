use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{EvidenceRecord, EvidenceRecorder, EvidenceType, decoded};
use crate::error::Result;

pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Filters are conjunctive; `None` matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceFilter {
    pub incident_id: Option<String>,
    pub evidence_type: Option<EvidenceType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the decoded content.
    pub text: Option<String>,
    /// Substring of the stored signature, e.g. a hex prefix.
    pub signature: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EvidenceFilter {
    fn default() -> Self {
        Self {
            incident_id: None,
            evidence_type: None,
            from: None,
            to: None,
            text: None,
            signature: None,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

impl EvidenceFilter {
    pub fn for_incident(incident_id: impl Into<String>) -> Self {
        Self {
            incident_id: Some(incident_id.into()),
            ..Default::default()
        }
    }

    fn matches(&self, record: &EvidenceRecord, needle: Option<&str>) -> bool {
        self.evidence_type.is_none_or(|t| record.evidence_type == t)
            && self.from.is_none_or(|from| record.timestamp >= from)
            && self.to.is_none_or(|to| record.timestamp <= to)
            && self
                .signature
                .as_deref()
                .is_none_or(|s| record.signature.contains(s.trim()))
            && needle.is_none_or(|n| record.content.to_lowercase().contains(n))
    }

    fn describe(&self) -> Value {
        json!({
            "incident_id": self.incident_id,
            "evidence_type": self.evidence_type,
            "from": self.from,
            "to": self.to,
            "text": self.text,
            "signature": self.signature,
            "limit": self.limit,
            "offset": self.offset,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSearchResult {
    pub evidence: Vec<EvidenceRecord>,
    pub total: usize,
    pub has_more: bool,
    pub search_metadata: Value,
}

impl EvidenceRecorder {
    /// Newest first. Repeated calls over unchanged storage return identical
    /// results.
    pub fn search_evidence(&self, filter: &EvidenceFilter) -> Result<EvidenceSearchResult> {
        let needle = filter
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        let mut hits: Vec<EvidenceRecord> = self
            .store
            .list_evidence(filter.incident_id.as_deref())?
            .into_iter()
            .map(decoded)
            .filter(|r| filter.matches(r, needle.as_deref()))
            .collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

        let total = hits.len();
        let limit = if filter.limit == 0 { DEFAULT_SEARCH_LIMIT } else { filter.limit };
        let page: Vec<EvidenceRecord> = hits.into_iter().skip(filter.offset).take(limit).collect();
        let has_more = filter.offset + page.len() < total;
        Ok(EvidenceSearchResult {
            search_metadata: json!({ "filter": filter.describe(), "returned": page.len() }),
            evidence: page,
            total,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::audit::RecordingAuditLog;
    use crate::evidence::{EvidenceMetadata, EvidenceSettings};
    use crate::redact::PatternRedactor;
    use crate::remote::LocalChannel;
    use crate::signature::{SignatureAlgorithm, sign};
    use crate::store::{ArtifactStore, MemoryStore};

    fn seeded() -> EvidenceRecorder {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now();
        for (i, (inc, ty, body)) in [
            ("inc-1", EvidenceType::ErrorLog, "PHP Fatal error: Allowed memory size exhausted"),
            ("inc-1", EvidenceType::CommandOutput, "wp core version: 6.4.2"),
            ("inc-1", EvidenceType::ErrorLog, "PHP Warning: deprecated"),
            ("inc-2", EvidenceType::ErrorLog, "Fatal error in other site"),
        ]
        .into_iter()
        .enumerate()
        {
            store
                .create_evidence(&EvidenceRecord {
                    id: format!("ev-{i}"),
                    incident_id: inc.into(),
                    evidence_type: ty,
                    signature: sign(body, SignatureAlgorithm::Sha256).hash,
                    content: body.into(),
                    metadata: EvidenceMetadata::default(),
                    timestamp: base + Duration::seconds(i as i64),
                })
                .expect("seed");
        }
        EvidenceRecorder::new(
            store,
            Arc::new(LocalChannel::new()),
            Arc::new(RecordingAuditLog::new()),
            Arc::new(PatternRedactor::new()),
            EvidenceSettings::default(),
        )
    }

    #[test]
    fn filters_are_conjunctive_and_newest_first() {
        let rec = seeded();
        let filter = EvidenceFilter {
            evidence_type: Some(EvidenceType::ErrorLog),
            ..EvidenceFilter::for_incident("inc-1")
        };
        let res = rec.search_evidence(&filter).expect("search");
        let ids: Vec<&str> = res.evidence.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ev-2", "ev-0"]);
        assert_eq!(res.total, 2);
        assert!(!res.has_more);
    }

    #[test]
    fn paging_reports_has_more() {
        let rec = seeded();
        let filter = EvidenceFilter {
            limit: 1,
            offset: 1,
            ..Default::default()
        };
        let res = rec.search_evidence(&filter).expect("search");
        assert_eq!(res.total, 4);
        assert_eq!(res.evidence.len(), 1);
        assert_eq!(res.evidence[0].id, "ev-2");
        assert!(res.has_more);
    }

    #[test]
    fn text_search_is_case_insensitive() {
        let rec = seeded();
        let filter = EvidenceFilter {
            text: Some("fatal ERROR".into()),
            ..Default::default()
        };
        let res = rec.search_evidence(&filter).expect("search");
        assert_eq!(res.total, 2);
    }

    #[test]
    fn signature_filter_matches_a_hash_fragment() {
        let rec = seeded();
        let hash = sign("wp core version: 6.4.2", SignatureAlgorithm::Sha256).hash;
        let hex = hash.strip_prefix("sha256:").expect("prefixed hash");
        let filter = EvidenceFilter {
            signature: Some(hex[..16].to_string()),
            ..Default::default()
        };
        let res = rec.search_evidence(&filter).expect("search");
        assert_eq!(res.total, 1);
        assert_eq!(res.evidence[0].id, "ev-1");
        assert_eq!(res.search_metadata["filter"]["signature"], filter.signature.clone().expect("set"));

        let none = EvidenceFilter {
            signature: Some("sha512:".into()),
            ..Default::default()
        };
        assert_eq!(rec.search_evidence(&none).expect("search").total, 0);
    }

    #[test]
    fn repeated_search_is_identical() {
        let rec = seeded();
        let filter = EvidenceFilter::for_incident("inc-1");
        let a = rec.search_evidence(&filter).expect("a");
        let b = rec.search_evidence(&filter).expect("b");
        assert_eq!(a.evidence, b.evidence);
        assert_eq!(a.search_metadata, b.search_metadata);
        assert_eq!(a.has_more, b.has_more);
    }
}

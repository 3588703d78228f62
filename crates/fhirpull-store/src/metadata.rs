//! The `metadata.json` run record.
//!
//! Every sub-export carries a metadata file with the normalized invocation
//! parameters, per-resource-type transaction times, the cohort snapshot
//! summary, bulk resume state, hydration task markers and the completion
//! flag. It is the contract that later runs use to resume interrupted work
//! and to resolve `--since=auto`.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use fhirpull_core::FhirInstant;

use crate::error::{Result, StoreError};

pub const METADATA_FILE: &str = "metadata.json";

/// Acquisition mode of a sub-export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    Bulk,
    Crawl,
}

impl std::fmt::Display for ExportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bulk => write!(f, "bulk"),
            Self::Crawl => write!(f, "crawl"),
        }
    }
}

/// Which resource date the since filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinceMode {
    #[default]
    Updated,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

impl Compression {
    pub fn is_gzip(self) -> bool {
        matches!(self, Self::Gzip)
    }
}

/// Normalized invocation parameters recorded in `metadata.json.params`.
///
/// Two invocations are "the same run" when their normalized parameters are
/// structurally equal; that is what allows an interrupted sub-export to be
/// reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportParams {
    pub fhir_url: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub type_filters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default)]
    pub since_mode: SinceMode,
    pub mode: ExportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub compression: Compression,
}

impl ExportParams {
    /// Sort and deduplicate the type list, sort the filters, and
    /// canonicalize the since instant to UTC `Z` form.
    pub fn normalize(mut self) -> Self {
        self.types.sort();
        self.types.dedup();
        self.type_filters.sort();
        self.type_filters.dedup();
        self.fhir_url = self.fhir_url.trim_end_matches('/').to_string();
        if let Some(since) = &self.since
            && let Ok(instant) = FhirInstant::from_str(since)
        {
            self.since = Some(instant.to_utc_string());
        }
        self
    }

    /// Stable content hash of the normalized parameters, used to compare
    /// runs without comparing nicknames.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.fhir_url.as_bytes());
        for t in &self.types {
            hasher.update(b"|t:");
            hasher.update(t.as_bytes());
        }
        for f in &self.type_filters {
            hasher.update(b"|f:");
            hasher.update(f.as_bytes());
        }
        if let Some(since) = &self.since {
            hasher.update(b"|s:");
            hasher.update(since.as_bytes());
        }
        hasher.update(b"|m:");
        hasher.update(self.mode.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Structural equality for sub-export reuse: everything except the
    /// nickname and compression, which do not change what is fetched.
    pub fn matches(&self, other: &ExportParams) -> bool {
        self.fhir_url == other.fhir_url
            && self.types == other.types
            && self.type_filters == other.type_filters
            && self.since == other.since
            && self.since_mode == other.since_mode
            && self.mode == other.mode
    }
}

/// Summary of the cohort a sub-export covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortInfo {
    /// Where the cohort came from: `group`, `id-list`, `id-file`,
    /// `source-dir`, or `all` for ungrouped bulk exports.
    pub source: String,
    /// Content hash of the sorted patient id set.
    pub hash: String,
    pub count: usize,
    /// The patient ids themselves, kept so the next run can compute the
    /// cohort delta.
    #[serde(default)]
    pub patient_ids: Vec<String>,
}

impl CohortInfo {
    pub fn new(source: impl Into<String>, mut patient_ids: Vec<String>) -> Self {
        patient_ids.sort();
        patient_ids.dedup();
        let mut hasher = Sha1::new();
        for id in &patient_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            source: source.into(),
            hash: hex::encode(hasher.finalize()),
            count: patient_ids.len(),
            patient_ids,
        }
    }
}

/// Per-task hydration progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HydrationStatus {
    pub complete: bool,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<FhirInstant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<FhirInstant>,
}

/// The whole `metadata.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub params: ExportParams,

    /// Upper bound of data completeness per resource type. Bulk runs record
    /// the manifest's single transaction time under every exported type;
    /// crawls record one instant per type.
    #[serde(rename = "transactionTimes", default)]
    pub transaction_times: BTreeMap<String, FhirInstant>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort: Option<CohortInfo>,

    /// Opaque bulk resume token; present only in bulk mode. The engine owns
    /// its shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_state: Option<serde_json::Value>,

    #[serde(default)]
    pub hydration: BTreeMap<String, HydrationStatus>,

    pub complete: bool,

    /// Number of crawl queries that failed after retries. Non-zero means
    /// the sub-export is a partial success and stays `complete = false`.
    #[serde(default)]
    pub failed_queries: u64,

    pub started: FhirInstant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<FhirInstant>,
}

impl Metadata {
    pub fn new(params: ExportParams) -> Self {
        Self {
            params,
            transaction_times: BTreeMap::new(),
            cohort: None,
            bulk_state: None,
            hydration: BTreeMap::new(),
            complete: false,
            failed_queries: 0,
            started: fhirpull_core::now_utc(),
            finished: None,
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let contents = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        serde_json::from_str(&contents).map_err(Into::into)
    }

    /// Atomically write the metadata: temp file in the same directory,
    /// fsync, rename over the final name.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        let contents = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, &contents).map_err(|e| StoreError::io(&tmp, e))?;
        let file = std::fs::File::open(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Record a transaction time, keeping the maximum seen for the type.
    pub fn record_transaction_time(&mut self, resource_type: &str, instant: FhirInstant) {
        self.transaction_times
            .entry(resource_type.to_string())
            .and_modify(|existing| {
                if instant > *existing {
                    *existing = instant;
                }
            })
            .or_insert(instant);
    }

    /// The single transaction time of a bulk run: the maximum recorded.
    pub fn single_transaction_time(&self) -> Option<FhirInstant> {
        self.transaction_times.values().max().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ExportParams {
        ExportParams {
            fhir_url: "http://srv/fhir/".into(),
            types: vec!["Observation".into(), "Condition".into(), "Condition".into()],
            type_filters: vec!["Observation?status=final".into()],
            since: Some("2023-05-15T14:30:00+02:00".into()),
            since_mode: SinceMode::Updated,
            mode: ExportMode::Crawl,
            nickname: None,
            compression: Compression::Gzip,
        }
    }

    #[test]
    fn test_normalize_sorts_and_canonicalizes() {
        let normalized = params().normalize();
        assert_eq!(normalized.types, vec!["Condition", "Observation"]);
        assert_eq!(normalized.fhir_url, "http://srv/fhir");
        assert_eq!(normalized.since.as_deref(), Some("2023-05-15T12:30:00Z"));
    }

    #[test]
    fn test_matches_ignores_nickname_and_compression() {
        let a = params().normalize();
        let mut b = a.clone();
        b.nickname = Some("second".into());
        b.compression = Compression::None;
        assert!(a.matches(&b));

        let mut c = a.clone();
        c.types.push("Patient".into());
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_hash_stable_under_normalization() {
        let a = params().normalize();
        let mut scrambled = params();
        scrambled.types.reverse();
        let b = scrambled.normalize();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_cohort_info_hash_and_count() {
        let a = CohortInfo::new("group", vec!["p2".into(), "p1".into(), "p1".into()]);
        assert_eq!(a.count, 2);
        assert_eq!(a.patient_ids, vec!["p1", "p2"]);

        let b = CohortInfo::new("group", vec!["p1".into(), "p2".into()]);
        assert_eq!(a.hash, b.hash);

        let c = CohortInfo::new("group", vec!["p1".into()]);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = Metadata::new(params().normalize());
        metadata.record_transaction_time(
            "Condition",
            "2023-05-15T14:30:00Z".parse().unwrap(),
        );
        metadata.save(dir.path()).unwrap();

        let loaded = Metadata::load(dir.path()).unwrap();
        assert_eq!(loaded.params, metadata.params);
        assert!(!loaded.complete);
        assert_eq!(
            loaded.transaction_times["Condition"].to_string(),
            "2023-05-15T14:30:00Z"
        );
        assert!(!dir.path().join("metadata.json.tmp").exists());
    }

    #[test]
    fn test_record_transaction_time_keeps_max() {
        let mut metadata = Metadata::new(params().normalize());
        metadata.record_transaction_time("Observation", "2023-01-02T00:00:00Z".parse().unwrap());
        metadata.record_transaction_time("Observation", "2023-01-01T00:00:00Z".parse().unwrap());
        assert_eq!(
            metadata.transaction_times["Observation"].to_string(),
            "2023-01-02T00:00:00Z"
        );
        assert_eq!(
            metadata.single_transaction_time().unwrap().to_string(),
            "2023-01-02T00:00:00Z"
        );
    }
}

//! Cohort resolution.
//!
//! Turns one of four mutually exclusive inputs into a set of local
//! `Patient.id` values: an inline identifier list, an identifier file
//! (newline or CSV with an `ID`/`MRN` column), the Patient NDJSON of
//! another workspace, or a server-side Group whose membership was
//! discovered through a Patient-only bulk export. When an `--id-system`
//! is given, identifier values are resolved against the server via
//! batched `Patient?identifier=system|value` searches; otherwise they are
//! taken as literal resource ids.
//!
//! Resolution also reconciles against the previous run's cohort snapshot:
//! removed patients land in `deleted/Patient.ndjson`, added patients are
//! flagged so the crawler pulls their full history without a since filter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fhirpull_client::{FhirClient, SearchPages, bundle_entries};
use fhirpull_store::{CohortInfo, parse_page_name, read_files};

use crate::error::{EngineError, Result};
use crate::scheduler::Scheduler;

/// How many identifier values go into one `Patient?identifier=` query.
const IDENTIFIER_BATCH: usize = 50;

/// Where the cohort comes from, in evaluation priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortSource {
    /// Comma-separated identifier values from the command line.
    IdList(Vec<String>),
    /// Newline file or CSV with an `ID`/`MRN` column.
    IdFile(PathBuf),
    /// Patient NDJSON of another workspace directory.
    SourceDir(PathBuf),
    /// Server-side FHIR Group id.
    Group(String),
}

impl CohortSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::IdList(_) => "id-list",
            Self::IdFile(_) => "id-file",
            Self::SourceDir(_) => "source-dir",
            Self::Group(_) => "group",
        }
    }
}

/// A resolved cohort plus its delta against the prior run.
#[derive(Debug, Clone)]
pub struct ResolvedCohort {
    pub source: String,
    /// Sorted, deduplicated local Patient ids.
    pub patient_ids: Vec<String>,
    /// Patients absent from the prior cohort; crawled with no since
    /// filter.
    pub new_patients: BTreeSet<String>,
    /// Patients present before but gone now; recorded in
    /// `deleted/Patient.ndjson`.
    pub removed: Vec<String>,
}

impl ResolvedCohort {
    pub fn info(&self) -> CohortInfo {
        CohortInfo::new(self.source.clone(), self.patient_ids.clone())
    }

    pub fn is_new(&self, patient_id: &str) -> bool {
        self.new_patients.contains(patient_id)
    }
}

pub struct CohortResolver {
    client: FhirClient,
    scheduler: Scheduler,
    /// Treat identifier values as `Patient.identifier[system=S]` instead
    /// of literal ids.
    pub id_system: Option<String>,
}

impl CohortResolver {
    pub fn new(client: FhirClient, scheduler: Scheduler) -> Self {
        Self {
            client,
            scheduler,
            id_system: None,
        }
    }

    pub fn with_id_system(mut self, id_system: Option<String>) -> Self {
        self.id_system = id_system;
        self
    }

    /// Resolve a non-group source to patient ids, then reconcile against
    /// the prior cohort snapshot. Group sources are resolved by the export
    /// driver (membership discovery needs the bulk exporter) and fed in
    /// through [`resolve_patient_pages`].
    ///
    /// [`resolve_patient_pages`]: CohortResolver::resolve_patient_pages
    pub async fn resolve(
        &self,
        source: &CohortSource,
        prior: Option<&CohortInfo>,
    ) -> Result<ResolvedCohort> {
        let identifiers = match source {
            CohortSource::IdList(values) => values.clone(),
            CohortSource::IdFile(path) => read_id_file(path)?,
            CohortSource::SourceDir(dir) => {
                let ids = patient_ids_from_dir(dir)?;
                return Ok(reconcile(source.label(), ids, prior));
            }
            CohortSource::Group(_) => {
                return Err(EngineError::config(
                    "group cohorts are resolved via bulk membership discovery",
                ));
            }
        };

        let ids = match &self.id_system {
            Some(system) => self.lookup_identifiers(system, &identifiers).await?,
            None => identifiers,
        };
        Ok(reconcile(source.label(), ids, prior))
    }

    /// Build the cohort from Patient NDJSON pages a membership-discovery
    /// export just produced.
    pub fn resolve_patient_pages(
        &self,
        pages: Vec<PathBuf>,
        prior: Option<&CohortInfo>,
    ) -> Result<ResolvedCohort> {
        let mut ids = Vec::new();
        for record in read_files(pages) {
            match record {
                Ok(record) if record.resource.resource_type() == "Patient" => {
                    ids.push(record.resource.id().to_string());
                }
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping malformed patient line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reconcile("group", ids, prior))
    }

    /// Resolve identifier values to Patient ids via batched, deduplicated
    /// `Patient?identifier=S|V` searches.
    async fn lookup_identifiers(
        &self,
        system: &str,
        identifiers: &[String],
    ) -> Result<Vec<String>> {
        let mut values: Vec<&String> = identifiers.iter().collect();
        values.sort();
        values.dedup();

        let mut ids = Vec::new();
        for batch in values.chunks(IDENTIFIER_BATCH) {
            self.scheduler.checkpoint()?;
            let joined = batch
                .iter()
                .map(|v| format!("{system}|{v}"))
                .collect::<Vec<_>>()
                .join(",");
            let mut url = self.client.absolute("Patient")?;
            url.query_pairs_mut()
                .append_pair("identifier", &joined)
                .append_pair("_elements", "id,identifier");

            let mut pages = SearchPages::new(self.client.clone(), url);
            while let Some(bundle) = pages.next_page().await? {
                self.scheduler.checkpoint()?;
                for resource in bundle_entries(&bundle) {
                    if resource.resource_type() == "Patient" {
                        ids.push(resource.id().to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// Compute the cohort delta: `new` relative to the prior snapshot crawl
/// without a since filter, `removed` get recorded as deleted.
fn reconcile(source: &str, ids: Vec<String>, prior: Option<&CohortInfo>) -> ResolvedCohort {
    let current: BTreeSet<String> = ids.into_iter().collect();
    let previous: BTreeSet<String> = prior
        .map(|p| p.patient_ids.iter().cloned().collect())
        .unwrap_or_default();

    let new_patients: BTreeSet<String> = match prior {
        // with no prior run, nobody is "new": everything is a first crawl
        None => BTreeSet::new(),
        Some(_) => current.difference(&previous).cloned().collect(),
    };
    let removed: Vec<String> = previous.difference(&current).cloned().collect();

    ResolvedCohort {
        source: source.to_string(),
        patient_ids: current.into_iter().collect(),
        new_patients,
        removed,
    }
}

/// Parse an identifier file: newline list, or CSV with a case-insensitive
/// `ID` or `MRN` header column.
fn read_id_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| EngineError::config(format!("cannot read {}: {e}", path.display())))?;
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

    let Some(first) = lines.next() else {
        return Ok(Vec::new());
    };

    if first.contains(',') {
        let headers: Vec<String> = split_csv(first)
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        let column = headers
            .iter()
            .position(|h| h == "id" || h == "mrn")
            .ok_or_else(|| {
                EngineError::config(format!(
                    "{} has no ID or MRN column (found: {})",
                    path.display(),
                    headers.join(", ")
                ))
            })?;
        Ok(lines
            .filter_map(|line| split_csv(line).into_iter().nth(column))
            .filter(|v| !v.is_empty())
            .collect())
    } else {
        let mut values = vec![first.trim().to_string()];
        values.extend(lines.map(|l| l.trim().to_string()));
        Ok(values.into_iter().filter(|v| !v.is_empty()).collect())
    }
}

fn split_csv(line: &str) -> Vec<String> {
    line.split(',')
        .map(|f| f.trim().trim_matches('"').to_string())
        .collect()
}

/// Collect Patient ids from the pooled Patient NDJSON of another
/// workspace.
fn patient_ids_from_dir(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::config(format!("cannot read {}: {e}", dir.display())))?;
    let mut pages: Vec<(u32, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str()
            && let Some(page) = parse_page_name(name)
            && page.resource_type == "Patient"
        {
            pages.push((page.index, entry.path()));
        }
    }
    if pages.is_empty() {
        return Err(EngineError::config(format!(
            "no Patient NDJSON found in {}",
            dir.display()
        )));
    }
    pages.sort_by_key(|(index, _)| *index);

    let mut ids = Vec::new();
    for record in read_files(pages.into_iter().map(|(_, p)| p).collect()) {
        match record {
            Ok(record) if record.resource.resource_type() == "Patient" => {
                ids.push(record.resource.id().to_string());
            }
            Ok(_) => {}
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "skipping malformed patient line");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ids)
}

//! Client-driven crawl engine.
//!
//! Fans out per-patient, per-resource-type searches under the scheduler's
//! budgets, streams every result page straight into per-type NDJSON
//! writers, de-duplicates on `(resourceType, id)`, and records one
//! transaction time per resource type. A single writer task owns each
//! type's files; patient tasks only route resources into channels.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use fhirpull_client::{FhirClient, SearchPages, bundle_entries};
use fhirpull_core::{FhirInstant, Resource};
use fhirpull_store::{EventLog, LogEvent, SinceMode, SubExport, WriterConfig};

use crate::cohort::ResolvedCohort;
use crate::error::{EngineError, Result};
use crate::scheduler::{Budget, Scheduler};

/// The nine standard Observation categories, applied as a default filter
/// (FHIR OR semantics) unless the user disables default filters.
pub const OBSERVATION_DEFAULT_CATEGORIES: [&str; 9] = [
    "activity",
    "exam",
    "imaging",
    "laboratory",
    "procedure",
    "social-history",
    "survey",
    "therapy",
    "vital-signs",
];

/// The creation/effective date search parameter used under `created`
/// mode, from the R4 search-parameter registry. Types without a usable
/// creation date (notably Patient and Device) crawl unfiltered.
pub fn created_date_param(resource_type: &str) -> Option<&'static str> {
    match resource_type {
        "AllergyIntolerance" => Some("date"),
        "CarePlan" => Some("date"),
        "Condition" => Some("recorded-date"),
        "DiagnosticReport" => Some("issued"),
        "DocumentReference" => Some("date"),
        "Encounter" => Some("date"),
        "Immunization" => Some("date"),
        "MedicationRequest" => Some("authoredon"),
        "Observation" => Some("date"),
        "Procedure" => Some("date"),
        "ServiceRequest" => Some("authored"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Resource types to crawl, in declared order.
    pub types: Vec<String>,
    /// Resolved since instant per type; a missing entry crawls the type's
    /// full history.
    pub since: BTreeMap<String, FhirInstant>,
    pub since_mode: SinceMode,
    /// `Type?query` filters; each matching filter runs as an independent
    /// query whose results are unioned.
    pub type_filters: Vec<String>,
    /// Apply the standard Observation category filter when no explicit
    /// filter targets Observation.
    pub default_filters: bool,
    /// Types already materialized by an earlier phase of this run (e.g.
    /// Patient pages written by group membership discovery).
    pub skip_types: BTreeSet<String>,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub written: BTreeMap<String, u64>,
    pub failed_queries: u64,
}

struct TypeSummary {
    resource_type: String,
    written: u64,
    max_last_updated: Option<FhirInstant>,
}

pub struct Crawler {
    client: FhirClient,
    scheduler: Scheduler,
    options: CrawlOptions,
}

impl Crawler {
    pub fn new(client: FhirClient, scheduler: Scheduler, options: CrawlOptions) -> Self {
        Self {
            client,
            scheduler,
            options,
        }
    }

    /// Crawl the cohort into the sub-export. Individual query failures are
    /// logged and counted, not fatal; the driver marks the sub-export
    /// incomplete when any remain.
    pub async fn run(
        &self,
        sub: &mut SubExport,
        cohort: &ResolvedCohort,
        log: Arc<EventLog>,
    ) -> Result<CrawlReport> {
        let crawl_types: Vec<String> = self
            .options
            .types
            .iter()
            .filter(|t| !self.options.skip_types.contains(*t))
            .cloned()
            .collect();

        // Fallback transaction time when a type has no update metadata:
        // the wall-clock start of its traversal.
        let started = fhirpull_core::now_utc();

        // One writer task per type; patient tasks route resources here.
        // The dedup set is seeded with ids already in this sub-export so a
        // resumed run never writes a record twice.
        let mut routes: HashMap<String, mpsc::Sender<Resource>> = HashMap::new();
        let mut writer_tasks = tokio::task::JoinSet::new();
        for resource_type in &crawl_types {
            let (tx, rx) = mpsc::channel::<Resource>(256);
            routes.insert(resource_type.clone(), tx);
            let writer = sub.writer(resource_type, self.options.writer.clone())?;
            let seen = existing_ids(sub, resource_type)?;
            writer_tasks.spawn(write_type(resource_type.clone(), writer, rx, seen));
        }

        let failed = Arc::new(AtomicU64::new(0));
        let mut patient_tasks = tokio::task::JoinSet::new();
        for patient_id in &cohort.patient_ids {
            let permit = self.scheduler.acquire(Budget::CrawlPatient).await;
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    // cancelled while fanning out; stop scheduling patients
                    drop(routes);
                    while writer_tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            };
            let crawler = CrawlWorker {
                client: self.client.clone(),
                scheduler: self.scheduler.clone(),
                options: self.options.clone(),
                routes: routes.clone(),
                log: log.clone(),
                failed: failed.clone(),
            };
            let patient_id = patient_id.clone();
            let ignore_since = cohort.is_new(&patient_id);
            let types = crawl_types.clone();
            patient_tasks.spawn(async move {
                let _permit = permit;
                crawler.crawl_patient(&patient_id, &types, ignore_since).await
            });
        }

        let mut cancelled = false;
        while let Some(joined) = patient_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(EngineError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    // fatal: stop siblings, let writers drain and close
                    self.scheduler.cancel();
                    drop(routes);
                    while writer_tasks.join_next().await.is_some() {}
                    return Err(e);
                }
                Err(e) => {
                    self.scheduler.cancel();
                    drop(routes);
                    while writer_tasks.join_next().await.is_some() {}
                    return Err(EngineError::config(format!("crawl task panicked: {e}")));
                }
            }
        }
        drop(routes);

        let mut report = CrawlReport::default();
        while let Some(joined) = writer_tasks.join_next().await {
            let summary = joined
                .map_err(|e| EngineError::config(format!("writer task panicked: {e}")))??;
            let transaction_time = summary.max_last_updated.unwrap_or(started);
            sub.metadata
                .record_transaction_time(&summary.resource_type, transaction_time);
            report
                .written
                .insert(summary.resource_type, summary.written);
        }
        report.failed_queries = failed.load(Ordering::Relaxed);
        sub.metadata.failed_queries = report.failed_queries;
        sub.save_metadata()?;

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(report)
    }
}

/// Per-patient crawl state shared with the fan-out tasks.
struct CrawlWorker {
    client: FhirClient,
    scheduler: Scheduler,
    options: CrawlOptions,
    routes: HashMap<String, mpsc::Sender<Resource>>,
    log: Arc<EventLog>,
    failed: Arc<AtomicU64>,
}

impl CrawlWorker {
    async fn crawl_patient(
        self,
        patient_id: &str,
        types: &[String],
        ignore_since: bool,
    ) -> Result<()> {
        let worker = Arc::new(self);
        // per-patient fan-out limit: this patient's type queries share one
        // semaphore, independent of other patients
        let type_budget = Arc::new(tokio::sync::Semaphore::new(
            worker.scheduler.budgets().crawl_types.max(1),
        ));
        let mut type_tasks = tokio::task::JoinSet::new();
        for resource_type in types {
            let permit = worker.scheduler.acquire_from(&type_budget).await?;
            let worker = worker.clone();
            let resource_type = resource_type.clone();
            let patient_id = patient_id.to_string();
            type_tasks.spawn(async move {
                let _permit = permit;
                worker
                    .crawl_patient_type(&patient_id, &resource_type, ignore_since)
                    .await
            });
        }
        let mut result = Ok(());
        while let Some(joined) = type_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => {
                    result = Err(EngineError::config(format!("type task panicked: {e}")));
                }
            }
        }
        result
    }

    /// Run all queries for one `(patient, type)` pair. A failed query is
    /// logged with its context and counted; the crawl carries on.
    async fn crawl_patient_type(
        &self,
        patient_id: &str,
        resource_type: &str,
        ignore_since: bool,
    ) -> Result<()> {
        let since = if ignore_since {
            None
        } else {
            self.options.since.get(resource_type).copied()
        };
        for params in self.build_queries(resource_type, patient_id, since) {
            match self.run_query(resource_type, &params).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.log.append(
                        &LogEvent::warn("crawl", format!("query failed after retries: {e}"))
                            .resource_type(resource_type)
                            .patient_id(patient_id)
                            .http_status(status_of(&e).unwrap_or_default()),
                    )?;
                    tracing::warn!(
                        patient_id,
                        resource_type,
                        error = %e,
                        "crawl query failed, continuing"
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_query(&self, resource_type: &str, params: &[(String, String)]) -> Result<()> {
        let mut url = self.client.absolute(resource_type)?;
        url.query_pairs_mut().extend_pairs(params);
        let mut pages = SearchPages::new(self.client.clone(), url);
        while let Some(bundle) = {
            self.scheduler.checkpoint()?;
            pages.next_page().await?
        } {
            for resource in bundle_entries(&bundle) {
                let Some(route) = self.routes.get(resource.resource_type()) else {
                    continue;
                };
                if route.send(resource).await.is_err() {
                    return Err(EngineError::Cancelled);
                }
            }
        }
        Ok(())
    }

    /// Build the search parameter sets for one `(patient, type)` pair.
    /// Explicit type filters each produce an independent query; otherwise
    /// a single query runs, with the default Observation category filter
    /// when applicable.
    fn build_queries(
        &self,
        resource_type: &str,
        patient_id: &str,
        since: Option<FhirInstant>,
    ) -> Vec<Vec<(String, String)>> {
        let mut base: Vec<(String, String)> = Vec::new();
        if resource_type == "Patient" {
            base.push(("_id".into(), patient_id.to_string()));
        } else {
            base.push(("patient".into(), patient_id.to_string()));
        }
        if let Some(since) = since {
            match self.options.since_mode {
                SinceMode::Updated => {
                    base.push(("_lastUpdated".into(), format!("ge{}", since.to_utc_string())));
                }
                SinceMode::Created => {
                    if let Some(param) = created_date_param(resource_type) {
                        base.push((param.into(), format!("ge{}", since.to_utc_string())));
                    }
                }
            }
        }

        let filters: Vec<Vec<(String, String)>> = self
            .options
            .type_filters
            .iter()
            .filter_map(|f| parse_type_filter(f, resource_type))
            .collect();

        if !filters.is_empty() {
            return filters
                .into_iter()
                .map(|extra| {
                    let mut params = base.clone();
                    params.extend(extra);
                    params
                })
                .collect();
        }

        if resource_type == "Observation" && self.options.default_filters {
            let mut params = base.clone();
            params.push((
                "category".into(),
                OBSERVATION_DEFAULT_CATEGORIES.join(","),
            ));
            return vec![params];
        }

        vec![base]
    }
}

/// Parse a `Type?k=v&k2=v2` filter expression targeted at the given type.
fn parse_type_filter(filter: &str, resource_type: &str) -> Option<Vec<(String, String)>> {
    let (target, query) = filter.split_once('?')?;
    if target != resource_type {
        return None;
    }
    Some(
        query
            .split('&')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect(),
    )
}

fn status_of(error: &EngineError) -> Option<u16> {
    match error {
        EngineError::Client(e) => e.status(),
        _ => None,
    }
}

/// Ids already written for a type in this sub-export, from a previous
/// interrupted run.
fn existing_ids(sub: &SubExport, resource_type: &str) -> Result<HashSet<String>> {
    let mut seen = HashSet::new();
    for record in fhirpull_store::read_files(sub.pages(resource_type)?) {
        match record {
            Ok(record) => {
                seen.insert(record.resource.id().to_string());
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "skipping malformed line while seeding dedup set");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(seen)
}

/// The single writer task for one resource type: de-duplicates on id,
/// tracks the max `meta.lastUpdated`, appends in arrival order.
async fn write_type(
    resource_type: String,
    mut writer: fhirpull_store::ResourceWriter,
    mut rx: mpsc::Receiver<Resource>,
    mut seen: HashSet<String>,
) -> Result<TypeSummary> {
    let mut max_last_updated: Option<FhirInstant> = None;
    let mut written = 0u64;

    while let Some(resource) = rx.recv().await {
        if resource.resource_type() != resource_type {
            continue;
        }
        if !seen.insert(resource.id().to_string()) {
            continue;
        }
        if let Some(updated) = resource.last_updated()
            && max_last_updated.is_none_or(|max| updated > max)
        {
            max_last_updated = Some(updated);
        }
        writer.append(&resource)?;
        written += 1;
    }
    writer.close()?;
    tracing::info!(resource_type = %resource_type, written, "crawl type finished");
    Ok(TypeSummary {
        resource_type,
        written,
        max_last_updated,
    })
}

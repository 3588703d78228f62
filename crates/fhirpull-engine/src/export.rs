//! The export driver: ties workspace, cohort, acquisition and hydration
//! together for one run.
//!
//! A run opens (or resumes) a sub-export, resolves the cohort and the
//! since lower bound, acquires data through the bulk exporter or the
//! crawler, hydrates the result, and pools the finished pages into the
//! workspace root. Re-running with parameters identical to the newest
//! complete sub-export is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use fhirpull_client::FhirClient;
use fhirpull_core::FhirInstant;
use fhirpull_store::{
    Compression, EventLog, ExportMode, ExportParams, LogEvent, SinceMode, SubExport, Workspace,
    WriterConfig, parse_page_name,
};

use crate::bulk::{BulkExporter, BulkOptions};
use crate::capability;
use crate::cohort::{CohortResolver, CohortSource, ResolvedCohort};
use crate::crawl::{CrawlOptions, Crawler};
use crate::error::{EngineError, Result};
use crate::hydrate::{HydrateOptions, Hydrator};
use crate::scheduler::Scheduler;

/// Since lower bound as requested on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SinceArg {
    /// No lower bound: full history.
    #[default]
    None,
    /// Resolve from the newest complete sub-export's transaction times.
    Auto,
    /// Explicit instant.
    At(FhirInstant),
}

/// Acquisition mode as requested; `Auto` probes the capability statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModeArg {
    #[default]
    Auto,
    Bulk,
    Crawl,
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub fhir_url: Url,
    pub mode: ModeArg,
    pub types: Vec<String>,
    pub type_filters: Vec<String>,
    pub since: SinceArg,
    /// `None` auto-detects: `updated` when the server advertises
    /// `_lastUpdated` search support, `created` otherwise.
    pub since_mode: Option<SinceMode>,
    pub cohort: Option<CohortSource>,
    pub id_system: Option<String>,
    pub nickname: Option<String>,
    pub compression: Compression,
    pub max_page_bytes: u64,
    pub default_filters: bool,
    /// Claim an in-progress sub-export even when parameters differ.
    pub resume: bool,
    /// Run the hydration stage after acquisition.
    pub hydrate: bool,
}

impl ExportRequest {
    pub fn new(fhir_url: Url) -> Self {
        Self {
            fhir_url,
            mode: ModeArg::Auto,
            types: Vec::new(),
            type_filters: Vec::new(),
            since: SinceArg::None,
            since_mode: None,
            cohort: None,
            id_system: None,
            nickname: None,
            compression: Compression::Gzip,
            max_page_bytes: fhirpull_store::writer::DEFAULT_MAX_PAGE_BYTES,
            default_filters: true,
            resume: false,
            hydrate: true,
        }
    }

    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_page_bytes: self.max_page_bytes,
            compression: self.compression,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub seq: u32,
    pub complete: bool,
    pub failed_queries: u64,
    /// The run was skipped because the newest complete sub-export already
    /// covers these parameters.
    pub no_op: bool,
}

/// Run one export end to end.
pub async fn run_export(
    client: &FhirClient,
    scheduler: &Scheduler,
    workspace: &Workspace,
    request: ExportRequest,
) -> Result<ExportOutcome> {
    // Re-running the parameters of the newest complete sub-export is a
    // no-op, except under --since=auto where every run is a fresh delta.
    // Checked before any network traffic, so a completed run re-invoked
    // performs no requests at all.
    if request.since != SinceArg::Auto
        && workspace.in_progress()?.is_none()
        && let Some((sub, metadata)) = workspace.latest_complete()?
        && request_matches_stored(&request, &metadata.params)
    {
        tracing::info!(dir = %sub.path.display(), "parameters already exported, nothing to do");
        let log = EventLog::open(&sub.path)?;
        log.append(&LogEvent::info("workspace", "run skipped: already complete"))?;
        return Ok(ExportOutcome {
            seq: sub.seq,
            complete: true,
            failed_queries: 0,
            no_op: true,
        });
    }

    let (mode, since_mode) = resolve_modes(client, &request).await?;

    let params = ExportParams {
        fhir_url: request.fhir_url.as_str().to_string(),
        types: request.types.clone(),
        type_filters: request.type_filters.clone(),
        since: match &request.since {
            SinceArg::None => None,
            SinceArg::Auto => Some("auto".to_string()),
            SinceArg::At(instant) => Some(instant.to_utc_string()),
        },
        since_mode,
        mode,
        nickname: request.nickname.clone(),
        compression: request.compression,
    }
    .normalize();

    let since_auto = workspace.since_auto()?;
    let prior_cohort = workspace
        .latest_complete()?
        .and_then(|(_, metadata)| metadata.cohort);

    let mut sub = workspace.open_subexport(params, request.resume)?;
    let log = Arc::new(sub.event_log()?);

    match mode {
        ExportMode::Bulk => {
            let since = match &request.since {
                SinceArg::None => None,
                SinceArg::At(instant) => Some(*instant),
                SinceArg::Auto => since_auto
                    .as_ref()
                    .and_then(|auto| auto.transaction_times.values().min().copied()),
            };
            let group = match &request.cohort {
                None => None,
                Some(CohortSource::Group(group)) => Some(group.clone()),
                Some(other) => {
                    return Err(EngineError::config(format!(
                        "bulk export only supports group cohorts, not {}",
                        other.label()
                    )));
                }
            };
            let exporter = BulkExporter::new(
                client.clone(),
                scheduler.clone(),
                BulkOptions {
                    group,
                    types: sub.metadata.params.types.clone(),
                    type_filters: sub.metadata.params.type_filters.clone(),
                    since,
                    writer: request.writer_config(),
                    ..BulkOptions::default()
                },
            );
            exporter.run(&mut sub, &log).await?;
        }
        ExportMode::Crawl => {
            let cohort = resolve_cohort(
                client,
                scheduler,
                &request,
                &mut sub,
                prior_cohort.as_ref(),
                &log,
            )
            .await?;

            sub.metadata.cohort = Some(cohort.info());
            sub.save_metadata()?;
            if !cohort.removed.is_empty() {
                sub.write_deleted_ids("Patient", &cohort.removed, request.compression)?;
                log.append(&LogEvent::info(
                    "cohort",
                    format!("{} patients removed since prior export", cohort.removed.len()),
                ))?;
            }

            if cohort.patient_ids.is_empty() {
                // an empty cohort is a valid, complete, zero-file export
                log.append(&LogEvent::info("cohort", "cohort is empty"))?;
                sub.metadata.complete = true;
                sub.metadata.finished = Some(fhirpull_core::now_utc());
                sub.save_metadata()?;
            } else {
                let mut skip_types = BTreeSet::new();
                if matches!(request.cohort, Some(CohortSource::Group(_))) {
                    // Patient pages were already written by membership
                    // discovery
                    skip_types.insert("Patient".to_string());
                }
                let since = resolve_crawl_since(&request, &sub, since_auto.as_ref());
                let crawler = Crawler::new(
                    client.clone(),
                    scheduler.clone(),
                    CrawlOptions {
                        types: sub.metadata.params.types.clone(),
                        since,
                        since_mode,
                        type_filters: sub.metadata.params.type_filters.clone(),
                        default_filters: request.default_filters,
                        skip_types,
                        writer: request.writer_config(),
                    },
                );
                let report = crawler.run(&mut sub, &cohort, log.clone()).await?;
                sub.metadata.complete = report.failed_queries == 0;
                sub.metadata.finished = Some(fhirpull_core::now_utc());
                sub.save_metadata()?;
            }
        }
    }

    if request.hydrate {
        let hydrator = Hydrator::new(
            client.clone(),
            scheduler.clone(),
            HydrateOptions {
                writer: request.writer_config(),
                ..HydrateOptions::default()
            },
        );
        let prior = pooled_pages(workspace, "Observation", Some(&sub))?;
        hydrator.run(&mut sub, prior, log.clone()).await?;
    }

    workspace.pool(&sub)?;
    log.append(&LogEvent::info("workspace", "sub-export pooled"))?;

    Ok(ExportOutcome {
        seq: sub.seq,
        complete: sub.metadata.complete,
        failed_queries: sub.metadata.failed_queries,
        no_op: false,
    })
}

/// Standalone hydration over an existing sub-export (the newest finished
/// one).
pub async fn run_hydrate(
    client: &FhirClient,
    scheduler: &Scheduler,
    workspace: &Workspace,
    options: HydrateOptions,
) -> Result<u32> {
    let target = workspace
        .list_subexports()?
        .into_iter()
        .rev()
        .find_map(|sub| match sub.load_metadata() {
            Ok(metadata) if metadata.finished.is_some() => Some((sub, metadata)),
            _ => None,
        });
    let Some((target, metadata)) = target else {
        return Err(EngineError::config(
            "no finished sub-export to hydrate in this workspace",
        ));
    };

    let mut sub = SubExport {
        seq: target.seq,
        label: target.label,
        dir: target.path,
        metadata,
    };
    let log = Arc::new(sub.event_log()?);
    let hydrator = Hydrator::new(client.clone(), scheduler.clone(), options);
    let prior = pooled_pages(workspace, "Observation", Some(&sub))?;
    hydrator.run(&mut sub, prior, log).await?;
    workspace.pool(&sub)?;
    Ok(sub.seq)
}

/// Whether a request re-states the stored parameters of a finished run,
/// without resolving auto-detected modes (that would need a capability
/// probe). An unset mode or since-mode accepts whatever the stored run
/// resolved to.
fn request_matches_stored(request: &ExportRequest, stored: &ExportParams) -> bool {
    let candidate = ExportParams {
        fhir_url: request.fhir_url.as_str().to_string(),
        types: request.types.clone(),
        type_filters: request.type_filters.clone(),
        since: match &request.since {
            SinceArg::None => None,
            SinceArg::Auto => Some("auto".to_string()),
            SinceArg::At(instant) => Some(instant.to_utc_string()),
        },
        since_mode: request.since_mode.unwrap_or(stored.since_mode),
        mode: match request.mode {
            ModeArg::Auto => stored.mode,
            ModeArg::Bulk => ExportMode::Bulk,
            ModeArg::Crawl => ExportMode::Crawl,
        },
        nickname: request.nickname.clone(),
        compression: request.compression,
    }
    .normalize();
    stored.matches(&candidate)
}

async fn resolve_modes(
    client: &FhirClient,
    request: &ExportRequest,
) -> Result<(ExportMode, SinceMode)> {
    let needs_probe = matches!(request.mode, ModeArg::Auto) || request.since_mode.is_none();
    let capabilities = if needs_probe {
        Some(client.capabilities().await?)
    } else {
        None
    };

    let mode = match request.mode {
        ModeArg::Bulk => ExportMode::Bulk,
        ModeArg::Crawl => ExportMode::Crawl,
        ModeArg::Auto => {
            let bulk_capable = capabilities
                .as_ref()
                .is_some_and(capability::supports_bulk_export);
            // identifier-based cohorts are inherently client-driven
            let cohort_allows_bulk = matches!(
                request.cohort,
                None | Some(CohortSource::Group(_))
            );
            if bulk_capable && cohort_allows_bulk {
                ExportMode::Bulk
            } else {
                ExportMode::Crawl
            }
        }
    };

    let since_mode = match request.since_mode {
        Some(mode) => mode,
        None => {
            if capabilities
                .as_ref()
                .is_some_and(capability::supports_last_updated)
            {
                SinceMode::Updated
            } else {
                SinceMode::Created
            }
        }
    };

    Ok((mode, since_mode))
}

async fn resolve_cohort(
    client: &FhirClient,
    scheduler: &Scheduler,
    request: &ExportRequest,
    sub: &mut SubExport,
    prior: Option<&fhirpull_store::CohortInfo>,
    log: &Arc<EventLog>,
) -> Result<ResolvedCohort> {
    let source = request
        .cohort
        .as_ref()
        .ok_or_else(|| EngineError::config("crawl requires a cohort (--group, --id-list, --id-file or --source-dir)"))?;

    let resolver = CohortResolver::new(client.clone(), scheduler.clone())
        .with_id_system(request.id_system.clone());

    match source {
        CohortSource::Group(group) => {
            // membership discovery: a Patient-only bulk export against the
            // Group, landing in this sub-export. A resumed run whose
            // discovery already finished (Patient pages present, no resume
            // token) goes straight to reading them back.
            if sub.pages("Patient")?.is_empty() || sub.metadata.bulk_state.is_some() {
                let exporter = BulkExporter::new(
                    client.clone(),
                    scheduler.clone(),
                    BulkOptions {
                        group: Some(group.clone()),
                        types: vec!["Patient".to_string()],
                        writer: request.writer_config(),
                        finalize: false,
                        ..BulkOptions::default()
                    },
                );
                exporter.run(sub, log).await?;
                // the discovery export's resume token is spent
                sub.metadata.bulk_state = None;
                sub.save_metadata()?;
            }
            resolver.resolve_patient_pages(sub.pages("Patient")?, prior)
        }
        other => resolver.resolve(other, prior).await,
    }
}

/// Per-type since instants for a crawl.
fn resolve_crawl_since(
    request: &ExportRequest,
    sub: &SubExport,
    since_auto: Option<&fhirpull_store::workspace::SinceAuto>,
) -> BTreeMap<String, FhirInstant> {
    let mut since = BTreeMap::new();
    for resource_type in &sub.metadata.params.types {
        let instant = match &request.since {
            SinceArg::None => None,
            SinceArg::At(instant) => Some(*instant),
            SinceArg::Auto => since_auto.and_then(|auto| auto.for_type(resource_type)),
        };
        if let Some(instant) = instant {
            since.insert(resource_type.clone(), instant);
        }
    }
    since
}

/// The workspace's pooled pages for a resource type, excluding links into
/// the given sub-export.
fn pooled_pages(
    workspace: &Workspace,
    resource_type: &str,
    exclude: Option<&SubExport>,
) -> Result<Vec<PathBuf>> {
    let exclude_dir = exclude.map(|sub| sub.dir_name());
    let mut pages: Vec<(u32, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(workspace.root())
        .map_err(|e| fhirpull_store::StoreError::io(workspace.root(), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_symlink() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
            continue;
        };
        let Some(page) = parse_page_name(&name) else {
            continue;
        };
        if page.resource_type != resource_type {
            continue;
        }
        if let Some(exclude_dir) = &exclude_dir
            && std::fs::read_link(&path)
                .map(|t| t.starts_with(exclude_dir))
                .unwrap_or(false)
        {
            continue;
        }
        pages.push((page.index, workspace.root().join(name)));
    }
    pages.sort_by_key(|(index, _)| *index);
    Ok(pages.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_since_arg_serialization_into_params() {
        let request = ExportRequest::new(Url::parse("http://srv/fhir").unwrap());
        assert_eq!(request.since, SinceArg::None);
        assert!(request.hydrate);
        assert_eq!(request.mode, ModeArg::Auto);
    }

    #[test]
    fn test_resolve_crawl_since_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let sub = ws
            .open_subexport(
                ExportParams {
                    fhir_url: "http://srv/fhir".into(),
                    types: vec!["Condition".into(), "Patient".into()],
                    type_filters: vec![],
                    since: None,
                    since_mode: SinceMode::Updated,
                    mode: ExportMode::Crawl,
                    nickname: None,
                    compression: Compression::None,
                },
                false,
            )
            .unwrap();

        let mut request = ExportRequest::new(Url::parse("http://srv/fhir").unwrap());
        request.since = SinceArg::At("2023-01-01T00:00:00Z".parse().unwrap());
        let since = resolve_crawl_since(&request, &sub, None);
        assert_eq!(since.len(), 2);
        assert_eq!(
            since["Condition"].to_string(),
            "2023-01-01T00:00:00Z"
        );

        request.since = SinceArg::None;
        assert!(resolve_crawl_since(&request, &sub, None).is_empty());
    }
}

//! Bulk Data Access export state machine.
//!
//! Drives `$export` kickoff, status polling, manifest interpretation and
//! parallel file download. Progress is checkpointed into
//! `metadata.json.bulk_state` after every transition and every finished
//! file, so an interrupted run resumes where it stopped: completed files
//! whose pages are intact on disk are skipped, partials are discarded and
//! refetched.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use url::Url;

use fhirpull_client::{ClientError, FhirClient};
use fhirpull_core::FhirInstant;
use fhirpull_store::{EventLog, LogEvent, SubExport, WriterConfig, parse_page_name};

use crate::error::{EngineError, Result};
use crate::scheduler::{Budget, Scheduler};

const NDJSON_ACCEPT: &str = "application/fhir+ndjson";

/// Options for one bulk export run.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Export against `Group/<id>/$export` instead of the system level.
    pub group: Option<String>,
    /// `_type` values; empty means server default (all types).
    pub types: Vec<String>,
    /// `_typeFilter` values, passed through verbatim.
    pub type_filters: Vec<String>,
    /// `_since` lower bound.
    pub since: Option<FhirInstant>,
    /// Poll delay floor when the server sends no `Retry-After`.
    pub poll_floor: Duration,
    /// Poll delay cap.
    pub poll_cap: Duration,
    /// Per-file download timeout.
    pub download_timeout: Duration,
    pub writer: WriterConfig,
    /// Mark the sub-export complete on success. The cohort resolver runs
    /// membership-discovery exports with this off.
    pub finalize: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            group: None,
            types: Vec::new(),
            type_filters: Vec::new(),
            since: None,
            poll_floor: Duration::from_secs(1),
            poll_cap: Duration::from_secs(60),
            download_timeout: Duration::from_secs(30 * 60),
            writer: WriterConfig::default(),
            finalize: true,
        }
    }
}

/// One `output[]`, `deleted[]` or `error[]` manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// The export manifest returned when polling completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkManifest {
    #[serde(rename = "transactionTime")]
    pub transaction_time: String,
    #[serde(default)]
    pub output: Vec<ManifestFile>,
    #[serde(default)]
    pub deleted: Vec<ManifestFile>,
    #[serde(default)]
    pub error: Vec<ManifestFile>,
}

/// A sealed page written for one downloaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    pub name: String,
    pub bytes: u64,
}

/// Resume bookkeeping for one completed manifest file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    pub url: String,
    pub bytes: u64,
    pub pages: Vec<PageRecord>,
}

/// The persisted state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BulkState {
    #[default]
    Init,
    Polling {
        status_url: String,
    },
    Downloading {
        status_url: String,
        manifest: BulkManifest,
        #[serde(default)]
        completed: Vec<DownloadRecord>,
    },
    Done,
    Failed {
        message: String,
    },
}

/// Bulk exporter over a sub-export directory.
pub struct BulkExporter {
    client: FhirClient,
    scheduler: Scheduler,
    options: BulkOptions,
}

impl BulkExporter {
    pub fn new(client: FhirClient, scheduler: Scheduler, options: BulkOptions) -> Self {
        Self {
            client,
            scheduler,
            options,
        }
    }

    /// Run the state machine to completion, resuming from any persisted
    /// state.
    pub async fn run(&self, sub: &mut SubExport, log: &EventLog) -> Result<()> {
        let mut state = load_state(sub);
        loop {
            state = match state {
                BulkState::Init => {
                    let status_url = match self.kickoff().await {
                        Ok(url) => url,
                        Err(e) => return self.fail(sub, log, e),
                    };
                    log.append(&LogEvent::info("bulk", "export accepted").url(&status_url))?;
                    BulkState::Polling { status_url }
                }
                BulkState::Polling { status_url } => {
                    let manifest = match self.poll(&status_url).await {
                        Ok(manifest) => manifest,
                        Err(e @ EngineError::Cancelled) => return Err(e),
                        Err(e) => return self.fail(sub, log, e),
                    };
                    log.append(&LogEvent::info(
                        "bulk",
                        format!(
                            "manifest received: {} output, {} deleted, {} error files",
                            manifest.output.len(),
                            manifest.deleted.len(),
                            manifest.error.len()
                        ),
                    ))?;
                    BulkState::Downloading {
                        status_url,
                        manifest,
                        completed: Vec::new(),
                    }
                }
                BulkState::Downloading {
                    status_url,
                    manifest,
                    completed,
                } => {
                    let completed = match self
                        .download_all(sub, log, &status_url, &manifest, completed)
                        .await
                    {
                        Ok(completed) => completed,
                        Err(e @ EngineError::Cancelled) => return Err(e),
                        Err(e) => return self.fail(sub, log, e),
                    };
                    self.process_deleted(sub, log, &manifest).await?;
                    self.process_errors(log, &manifest).await?;
                    self.finalize(sub, &status_url, &manifest, completed).await?;
                    BulkState::Done
                }
                BulkState::Done => return Ok(()),
                BulkState::Failed { message } => return Err(EngineError::bulk_failed(message)),
            };
            persist_state(sub, &state)?;
        }
    }

    /// Record a terminal failure. The sub-export is marked finished (but
    /// not complete) so it no longer counts as in-progress: a failed
    /// export cannot be resumed, the user starts a new run.
    fn fail(&self, sub: &mut SubExport, log: &EventLog, error: EngineError) -> Result<()> {
        let message = error.to_string();
        let _ = log.append(&LogEvent::error("bulk", &message));
        remove_temporaries(sub);
        sub.metadata.finished = Some(fhirpull_core::now_utc());
        let _ = persist_state(
            sub,
            &BulkState::Failed {
                message: message.clone(),
            },
        );
        Err(error)
    }

    /// Kickoff per the Bulk Data IG POST variant: a Parameters resource
    /// with `Prefer: respond-async`, expecting 202 + `Content-Location`.
    async fn kickoff(&self) -> Result<String> {
        let path = match &self.options.group {
            Some(group) => format!("Group/{group}/$export"),
            None => "$export".to_string(),
        };
        let url = self.client.absolute(&path).map_err(EngineError::Client)?;

        let mut parameter = vec![serde_json::json!({
            "name": "_outputFormat",
            "valueString": NDJSON_ACCEPT
        })];
        if !self.options.types.is_empty() {
            parameter.push(serde_json::json!({
                "name": "_type",
                "valueString": self.options.types.join(",")
            }));
        }
        if let Some(since) = &self.options.since {
            parameter.push(serde_json::json!({
                "name": "_since",
                "valueInstant": since.to_utc_string()
            }));
        }
        for filter in &self.options.type_filters {
            parameter.push(serde_json::json!({
                "name": "_typeFilter",
                "valueString": filter
            }));
        }
        let body = serde_json::json!({
            "resourceType": "Parameters",
            "parameter": parameter
        });

        tracing::info!(url = %url, "bulk kickoff");
        let response = self.client.kickoff(url.clone(), &body).await?;
        if response.status().as_u16() != 202 {
            return Err(EngineError::bulk_failed(format!(
                "kickoff returned HTTP {} instead of 202",
                response.status().as_u16()
            )));
        }
        response
            .headers()
            .get("Content-Location")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| {
                EngineError::bulk_failed("kickoff response missing Content-Location header")
            })
    }

    /// Poll the status URL until the manifest arrives. A 410 here means
    /// the server discarded the export; only this call site reads 410
    /// that way.
    async fn poll(&self, status_url: &str) -> Result<BulkManifest> {
        let url = Url::parse(status_url)
            .map_err(|e| EngineError::bulk_failed(format!("bad status URL: {e}")))?;
        loop {
            self.scheduler.checkpoint()?;
            let response = match self
                .client
                .get_response(url.clone(), "application/json")
                .await
            {
                Ok(response) => response,
                Err(ClientError::Status {
                    status: 410, url, ..
                }) => {
                    return Err(EngineError::Client(ClientError::ExportExpired { url }));
                }
                Err(e) => return Err(e.into()),
            };
            match response.status().as_u16() {
                202 => {
                    let delay = fhirpull_client::client::retry_after(&response)
                        .unwrap_or(self.options.poll_floor)
                        .clamp(self.options.poll_floor, self.options.poll_cap);
                    if let Some(progress) = response
                        .headers()
                        .get("X-Progress")
                        .and_then(|v| v.to_str().ok())
                    {
                        tracing::debug!(progress, "bulk export in progress");
                    }
                    tokio::time::sleep(delay).await;
                }
                200 => {
                    let manifest: BulkManifest = response.json().await.map_err(|e| {
                        EngineError::bulk_failed(format!("malformed manifest: {e}"))
                    })?;
                    return Ok(manifest);
                }
                other => {
                    return Err(EngineError::bulk_failed(format!(
                        "unexpected HTTP {other} while polling"
                    )));
                }
            }
        }
    }

    /// Download all manifest output files, one task per resource type so a
    /// single writer owns each type's pages, bounded by the bulk-download
    /// budget per file stream.
    async fn download_all(
        &self,
        sub: &mut SubExport,
        log: &EventLog,
        status_url: &str,
        manifest: &BulkManifest,
        completed: Vec<DownloadRecord>,
    ) -> Result<Vec<DownloadRecord>> {
        let completed = resume_cleanup(sub, log, manifest, completed)?;
        let done_urls: std::collections::BTreeSet<String> =
            completed.iter().map(|r| r.url.clone()).collect();

        let mut by_type: BTreeMap<String, Vec<ManifestFile>> = BTreeMap::new();
        for file in &manifest.output {
            if done_urls.contains(&file.url) {
                continue;
            }
            by_type
                .entry(file.resource_type.clone())
                .or_default()
                .push(file.clone());
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Result<DownloadRecord>>();
        let child = self.scheduler.child_token();
        let mut tasks = tokio::task::JoinSet::new();
        for (resource_type, files) in by_type {
            let client = self.client.clone();
            let scheduler = self.scheduler.clone();
            let child = child.clone();
            let dir = sub.dir.clone();
            let writer_config = self.options.writer.clone();
            let timeout = self.options.download_timeout;
            let tx = tx.clone();
            tasks.spawn(async move {
                for file in files {
                    if child.is_cancelled() {
                        let _ = tx.send(Err(EngineError::Cancelled));
                        return;
                    }
                    let result = download_file(
                        &client,
                        &scheduler,
                        &child,
                        &dir,
                        &resource_type,
                        &file,
                        writer_config.clone(),
                        timeout,
                    )
                    .await;
                    let failed = result.is_err();
                    let _ = tx.send(result);
                    if failed {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut completed = completed;
        let mut first_error: Option<EngineError> = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(record) => {
                    tracing::info!(url = %record.url, bytes = record.bytes, "bulk file downloaded");
                    completed.push(record);
                    persist_state(
                        sub,
                        &BulkState::Downloading {
                            status_url: status_url.to_string(),
                            manifest: manifest.clone(),
                            completed: completed.clone(),
                        },
                    )?;
                }
                Err(e) => {
                    if first_error.is_none() {
                        // stop the sibling downloads, keep what finished
                        child.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }
        while tasks.join_next().await.is_some() {}

        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Extract deleted identifiers from the manifest's history Bundles.
    async fn process_deleted(
        &self,
        sub: &SubExport,
        log: &EventLog,
        manifest: &BulkManifest,
    ) -> Result<()> {
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for file in &manifest.deleted {
            self.scheduler.checkpoint()?;
            let url = Url::parse(&file.url)
                .map_err(|e| EngineError::bulk_failed(format!("bad deleted URL: {e}")))?;
            let response = self.client.stream(url, self.options.download_timeout).await?;
            let body = response
                .text()
                .await
                .map_err(|e| EngineError::bulk_failed(format!("deleted file read failed: {e}")))?;
            for line in body.lines().filter(|l| !l.trim().is_empty()) {
                let Ok(bundle) = serde_json::from_str::<serde_json::Value>(line) else {
                    log.append(&LogEvent::warn("bulk", "skipping malformed deleted bundle line"))?;
                    continue;
                };
                for entry in bundle
                    .get("entry")
                    .and_then(|e| e.as_array())
                    .into_iter()
                    .flatten()
                {
                    let method = entry
                        .pointer("/request/method")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default();
                    if method != "DELETE" {
                        continue;
                    }
                    let Some(reference) = entry
                        .pointer("/request/url")
                        .and_then(|u| u.as_str())
                    else {
                        continue;
                    };
                    if let Ok(parsed) = fhirpull_core::parse_reference(
                        reference,
                        Some(self.client.base_url().as_str()),
                    ) {
                        by_type
                            .entry(parsed.resource_type)
                            .or_default()
                            .push(parsed.id);
                    }
                }
            }
        }
        for (resource_type, ids) in by_type {
            let path = sub.write_deleted_ids(
                &resource_type,
                &ids,
                sub.metadata.params.compression,
            )?;
            log.append(
                &LogEvent::info("bulk", format!("{} deletions recorded", ids.len()))
                    .resource_type(&resource_type)
                    .url(path.display().to_string()),
            )?;
        }
        Ok(())
    }

    /// Fetch `error[]` OperationOutcome files; each is a warning, never
    /// fatal.
    async fn process_errors(&self, log: &EventLog, manifest: &BulkManifest) -> Result<()> {
        for file in &manifest.error {
            self.scheduler.checkpoint()?;
            let Ok(url) = Url::parse(&file.url) else {
                log.append(&LogEvent::warn("bulk", "unparseable error-file URL").url(&file.url))?;
                continue;
            };
            match self.client.stream(url, self.options.download_timeout).await {
                Ok(response) => {
                    let body = response.text().await.unwrap_or_default();
                    for line in body.lines().filter(|l| !l.trim().is_empty()) {
                        let diagnostics = serde_json::from_str::<serde_json::Value>(line)
                            .ok()
                            .and_then(|outcome| {
                                outcome.get("issue")?.as_array()?.iter().find_map(|i| {
                                    i.get("diagnostics")
                                        .and_then(|d| d.as_str())
                                        .map(ToString::to_string)
                                })
                            })
                            .unwrap_or_else(|| "server-reported export error".to_string());
                        log.append(&LogEvent::warn("bulk", diagnostics).url(&file.url))?;
                    }
                }
                Err(e) => {
                    log.append(
                        &LogEvent::warn("bulk", format!("could not fetch error file: {e}"))
                            .url(&file.url),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        sub: &mut SubExport,
        status_url: &str,
        manifest: &BulkManifest,
        completed: Vec<DownloadRecord>,
    ) -> Result<()> {
        let transaction_time: FhirInstant = manifest
            .transaction_time
            .parse()
            .map_err(|e| EngineError::bulk_failed(format!("bad transactionTime: {e}")))?;

        let mut types: Vec<String> = manifest
            .output
            .iter()
            .map(|f| f.resource_type.clone())
            .collect();
        types.extend(sub.metadata.params.types.iter().cloned());
        types.sort_unstable();
        types.dedup();
        for resource_type in types {
            sub.metadata
                .record_transaction_time(&resource_type, transaction_time);
        }

        persist_state(
            sub,
            &BulkState::Downloading {
                status_url: status_url.to_string(),
                manifest: manifest.clone(),
                completed,
            },
        )?;

        if self.options.finalize {
            sub.metadata.complete = true;
            sub.metadata.finished = Some(fhirpull_core::now_utc());
            persist_state(sub, &BulkState::Done)?;
        }

        // Spec-compliant cleanup; a failure here is recorded, never fatal.
        if let Ok(url) = Url::parse(status_url)
            && let Err(e) = self.client.delete(url).await
        {
            tracing::warn!(error = %e, "status URL cleanup failed");
        }
        Ok(())
    }
}

fn load_state(sub: &SubExport) -> BulkState {
    sub.metadata
        .bulk_state
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn persist_state(sub: &mut SubExport, state: &BulkState) -> Result<()> {
    sub.metadata.bulk_state = Some(serde_json::to_value(state).map_err(fhirpull_store::StoreError::from)?);
    sub.save_metadata()?;
    Ok(())
}

fn remove_temporaries(sub: &SubExport) {
    if let Ok(entries) = std::fs::read_dir(&sub.dir) {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(".tmp"))
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Drop stray temporaries and any page not attributable to a completed
/// download; those belong to an interrupted file and will be refetched.
/// Records whose pages no longer match on disk are invalidated too.
fn resume_cleanup(
    sub: &SubExport,
    log: &EventLog,
    manifest: &BulkManifest,
    completed: Vec<DownloadRecord>,
) -> Result<Vec<DownloadRecord>> {
    remove_temporaries(sub);

    let mut kept = Vec::new();
    let mut attributed: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for record in completed {
        let intact = record.pages.iter().all(|page| {
            sub.dir
                .join(&page.name)
                .metadata()
                .map(|m| m.len() == page.bytes)
                .unwrap_or(false)
        });
        if intact {
            attributed.extend(record.pages.iter().map(|p| p.name.clone()));
            kept.push(record);
        } else {
            log.append(
                &LogEvent::warn("bulk", "discarding partially downloaded file").url(&record.url),
            )?;
            for page in &record.pages {
                let _ = std::fs::remove_file(sub.dir.join(&page.name));
            }
        }
    }

    let manifest_types: std::collections::BTreeSet<&str> = manifest
        .output
        .iter()
        .map(|f| f.resource_type.as_str())
        .collect();
    if let Ok(entries) = std::fs::read_dir(&sub.dir) {
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if let Some(page) = parse_page_name(&name)
                && manifest_types.contains(page.resource_type.as_str())
                && !attributed.contains(&name)
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    Ok(kept)
}

/// Stream one manifest file to disk through a rolling writer.
#[allow(clippy::too_many_arguments)]
async fn download_file(
    client: &FhirClient,
    scheduler: &Scheduler,
    cancel: &tokio_util::sync::CancellationToken,
    dir: &std::path::Path,
    resource_type: &str,
    file: &ManifestFile,
    writer_config: WriterConfig,
    timeout: Duration,
) -> Result<DownloadRecord> {
    let _permit = scheduler.acquire(Budget::BulkDownload).await?;
    let url = Url::parse(&file.url)
        .map_err(|e| EngineError::bulk_failed(format!("bad output URL: {e}")))?;

    let first_index = fhirpull_store::writer::next_page_index(dir, resource_type)?;
    let mut writer =
        fhirpull_store::ResourceWriter::new(dir, resource_type, writer_config, first_index);

    let response = client.stream(url, timeout).await?;
    let mut stream = response.bytes_stream();
    let mut carry: Vec<u8> = Vec::new();
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            writer.abort();
            return Err(EngineError::Cancelled);
        }
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                writer.abort();
                return Err(EngineError::bulk_failed(format!(
                    "download stream failed for {}: {e}",
                    file.url
                )));
            }
        };
        total += chunk.len() as u64;
        carry.extend_from_slice(&chunk);
        let mut start = 0;
        while let Some(pos) = carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos + 1;
            let line = &carry[start..end];
            if line.iter().any(|&b| !b.is_ascii_whitespace()) {
                if let Err(e) = writer.append_line(line) {
                    writer.abort();
                    return Err(e.into());
                }
            }
            start = end;
        }
        carry.drain(..start);
    }
    // final line without trailing newline
    if carry.iter().any(|&b| !b.is_ascii_whitespace()) {
        carry.push(b'\n');
        if let Err(e) = writer.append_line(&carry) {
            writer.abort();
            return Err(e.into());
        }
    }

    let pages = writer.close()?;
    let mut page_records = Vec::new();
    for path in pages {
        let bytes = path
            .metadata()
            .map(|m| m.len())
            .map_err(|e| fhirpull_store::StoreError::io(&path, e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        page_records.push(PageRecord { name, bytes });
    }

    Ok(DownloadRecord {
        url: file.url.clone(),
        bytes: total,
        pages: page_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let state = BulkState::Downloading {
            status_url: "http://srv/status/1".into(),
            manifest: BulkManifest {
                transaction_time: "2023-06-01T00:00:00Z".into(),
                output: vec![ManifestFile {
                    resource_type: "Patient".into(),
                    url: "http://srv/files/p1".into(),
                    count: Some(10),
                }],
                deleted: vec![],
                error: vec![],
            },
            completed: vec![DownloadRecord {
                url: "http://srv/files/p1".into(),
                bytes: 1234,
                pages: vec![PageRecord {
                    name: "Patient.001.ndjson.gz".into(),
                    bytes: 567,
                }],
            }],
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state"], "downloading");
        let back: BulkState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_default_state_is_init() {
        assert_eq!(BulkState::default(), BulkState::Init);
    }

    #[test]
    fn test_manifest_parsing() {
        let manifest: BulkManifest = serde_json::from_str(
            r#"{
                "transactionTime": "2023-06-01T00:00:00Z",
                "request": "http://srv/fhir/$export?_type=Patient",
                "requiresAccessToken": true,
                "output": [
                    {"type": "Patient", "url": "http://srv/files/1", "count": 2}
                ],
                "error": []
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.output.len(), 1);
        assert_eq!(manifest.output[0].resource_type, "Patient");
        assert!(manifest.deleted.is_empty());
    }
}

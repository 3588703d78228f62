//! Post-acquisition hydration.
//!
//! Three idempotent tasks run over a finished sub-export:
//!
//! 1. **attachments**: inline note bodies into DocumentReference and
//!    DiagnosticReport attachments that carry a `url` but no `data`.
//! 2. **observations**: fetch Observations referenced by
//!    `DiagnosticReport.result` or `Observation.hasMember` but absent from
//!    the export.
//! 3. **medications**: fetch the Medications referenced by
//!    `MedicationRequest.medicationReference`.
//!
//! Each task records a completion marker in `metadata.json.hydration` and
//! is skipped on re-run unless forced. Hydrated copies supersede the
//! original lines: lookups always take the highest-numbered occurrence of
//! a `(type, id)` within the sub-export, so a second run finds nothing
//! left to fetch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use sha1::{Digest, Sha1};
use url::Url;

use fhirpull_client::FhirClient;
use fhirpull_core::{Resource, ResourceKey, parse_reference};
use fhirpull_store::{
    EventLog, HydrationStatus, LogEvent, SubExport, WriterConfig, read_file, read_files,
};

use crate::error::Result;
use crate::scheduler::{Budget, Scheduler};

/// Tag marking resources rewritten by hydration.
pub const HYDRATION_TAG_SYSTEM: &str = "urn:fhirpull:hydrated";

const ACCEPTED_CONTENT_TYPES: [&str; 2] = ["text/plain", "text/html"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationTask {
    Attachments,
    Observations,
    Medications,
}

impl HydrationTask {
    pub fn name(self) -> &'static str {
        match self {
            Self::Attachments => "attachments",
            Self::Observations => "observations",
            Self::Medications => "medications",
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Attachments, Self::Observations, Self::Medications]
    }
}

#[derive(Debug, Clone)]
pub struct HydrateOptions {
    pub tasks: Vec<HydrationTask>,
    /// Re-run tasks whose completion marker is already set.
    pub force: bool,
    pub writer: WriterConfig,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self {
            tasks: HydrationTask::all().to_vec(),
            force: false,
            writer: WriterConfig::default(),
        }
    }
}

pub struct Hydrator {
    client: FhirClient,
    scheduler: Scheduler,
    options: HydrateOptions,
}

impl Hydrator {
    pub fn new(client: FhirClient, scheduler: Scheduler, options: HydrateOptions) -> Self {
        Self {
            client,
            scheduler,
            options,
        }
    }

    /// Run the selected tasks. `prior_observation_pages` holds Observation
    /// NDJSON from earlier sub-exports (the workspace's pooled files), so
    /// already-exported Observations are not fetched again.
    pub async fn run(
        &self,
        sub: &mut SubExport,
        prior_observation_pages: Vec<PathBuf>,
        log: Arc<EventLog>,
    ) -> Result<()> {
        for task in self.options.tasks.clone() {
            let name = task.name();
            if !self.options.force
                && sub
                    .metadata
                    .hydration
                    .get(name)
                    .is_some_and(|status| status.complete)
            {
                tracing::info!(task = name, "hydration task already complete, skipping");
                continue;
            }
            self.scheduler.checkpoint()?;

            let started = fhirpull_core::now_utc();
            sub.metadata.hydration.insert(
                name.to_string(),
                HydrationStatus {
                    complete: false,
                    count: 0,
                    started: Some(started),
                    finished: None,
                },
            );
            sub.save_metadata()?;

            let count = match task {
                HydrationTask::Attachments => self.inline_attachments(sub, &log).await?,
                HydrationTask::Observations => {
                    self.fetch_missing_observations(sub, &prior_observation_pages, &log)
                        .await?
                }
                HydrationTask::Medications => self.fetch_medications(sub, &log).await?,
            };

            sub.metadata.hydration.insert(
                name.to_string(),
                HydrationStatus {
                    complete: true,
                    count,
                    started: Some(started),
                    finished: Some(fhirpull_core::now_utc()),
                },
            );
            sub.save_metadata()?;
            log.append(&LogEvent::info(
                "hydrate",
                format!("task {name} complete: {count} resources"),
            ))?;
        }
        Ok(())
    }

    /// Inline note attachments; returns the number of attachments
    /// inlined.
    async fn inline_attachments(&self, sub: &mut SubExport, log: &EventLog) -> Result<u64> {
        let mut latest = load_latest(sub, &["DocumentReference", "DiagnosticReport"])?;

        // Collect fetchable attachments as (resource key, JSON pointer).
        let mut jobs: Vec<(ResourceKey, String, Url, Option<String>)> = Vec::new();
        for (key, resource) in &latest {
            for (pointer, attachment) in attachments_of(resource) {
                if attachment.get("data").is_some() {
                    continue;
                }
                let Some(raw_url) = attachment.get("url").and_then(Value::as_str) else {
                    continue;
                };
                let content_type = attachment
                    .get("contentType")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                if let Some(ct) = &content_type
                    && !is_accepted_content_type(ct)
                {
                    log.append(
                        &LogEvent::info(
                            "hydrate",
                            format!("skipping attachment with content type {ct}"),
                        )
                        .resource_type(&key.resource_type)
                        .url(raw_url),
                    )?;
                    continue;
                }
                let url = if raw_url.contains("://") {
                    match Url::parse(raw_url) {
                        Ok(url) => url,
                        Err(_) => {
                            log.append(
                                &LogEvent::warn("hydrate", "unparseable attachment URL")
                                    .url(raw_url),
                            )?;
                            continue;
                        }
                    }
                } else {
                    self.client.absolute(raw_url)?
                };
                jobs.push((key.clone(), pointer, url, content_type));
            }
        }

        // Fetch bodies under the attachment budget.
        let mut fetched: Vec<(ResourceKey, String, Vec<u8>)> = Vec::new();
        let mut tasks = tokio::task::JoinSet::new();
        for (key, pointer, url, content_type) in jobs {
            let client = self.client.clone();
            let scheduler = self.scheduler.clone();
            tasks.spawn(async move {
                let _permit = scheduler.acquire(Budget::Attachment).await?;
                let accept = content_type.as_deref().unwrap_or("text/plain, text/html");
                let body = client.fetch_binary(url.clone(), accept).await?;
                Ok::<_, crate::error::EngineError>((key, pointer, url, body))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (key, pointer, url, body) = joined
                .map_err(|e| crate::error::EngineError::config(format!("task panicked: {e}")))??;
            match body {
                Some((bytes, response_type)) => {
                    if let Some(ct) = &response_type
                        && !is_accepted_content_type(ct)
                    {
                        log.append(
                            &LogEvent::info(
                                "hydrate",
                                format!("server returned unaccepted content type {ct}"),
                            )
                            .url(url.as_str()),
                        )?;
                        continue;
                    }
                    fetched.push((key, pointer, bytes));
                }
                None => {
                    log.append(
                        &LogEvent::warn("hydrate", "attachment not found")
                            .resource_type(&key.resource_type)
                            .url(url.as_str())
                            .http_status(404),
                    )?;
                }
            }
        }

        // Apply bodies and rewrite modified resources into fresh pages.
        let mut modified: BTreeSet<ResourceKey> = BTreeSet::new();
        let mut inlined = 0u64;
        for (key, pointer, bytes) in fetched {
            let Some(resource) = latest.get_mut(&key) else {
                continue;
            };
            let Some(attachment) = resource.as_value_mut().pointer_mut(&pointer) else {
                continue;
            };
            let Some(obj) = attachment.as_object_mut() else {
                continue;
            };
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            obj.insert("data".into(), Value::String(BASE64.encode(&bytes)));
            obj.insert("size".into(), Value::from(bytes.len() as u64));
            obj.insert(
                "hash".into(),
                Value::String(BASE64.encode(hasher.finalize())),
            );
            modified.insert(key);
            inlined += 1;
        }

        let mut by_type: BTreeMap<String, Vec<ResourceKey>> = BTreeMap::new();
        for key in modified {
            by_type.entry(key.resource_type.clone()).or_default().push(key);
        }
        for (resource_type, keys) in by_type {
            let mut writer = sub.writer(&resource_type, self.options.writer.clone())?;
            for key in keys {
                if let Some(resource) = latest.get_mut(&key) {
                    resource.add_meta_tag(HYDRATION_TAG_SYSTEM, "notes-inlined");
                    writer.append(resource)?;
                }
            }
            writer.close()?;
        }

        Ok(inlined)
    }

    /// Close missing Observation references; returns the number fetched.
    async fn fetch_missing_observations(
        &self,
        sub: &mut SubExport,
        prior_pages: &[PathBuf],
        log: &EventLog,
    ) -> Result<u64> {
        let base_url = self.client.base_url().as_str().to_string();

        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for record in sub_records(sub, "DiagnosticReport")? {
            for reference in references_at(record.as_value(), "result") {
                if let Ok(parsed) = parse_reference(&reference, Some(&base_url))
                    && parsed.resource_type == "Observation"
                {
                    referenced.insert(parsed.id);
                }
            }
        }
        let mut present: BTreeSet<String> = BTreeSet::new();
        for record in sub_records(sub, "Observation")? {
            present.insert(record.id().to_string());
            for reference in references_at(record.as_value(), "hasMember") {
                if let Ok(parsed) = parse_reference(&reference, Some(&base_url))
                    && parsed.resource_type == "Observation"
                {
                    referenced.insert(parsed.id);
                }
            }
        }
        for record in read_files(prior_pages.to_vec()) {
            match record {
                Ok(record) if record.resource.resource_type() == "Observation" => {
                    present.insert(record.resource.id().to_string());
                }
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping malformed prior observation line");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let missing: Vec<String> = referenced.difference(&present).cloned().collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let resources = self.fetch_by_id("Observation", missing, log).await?;
        let count = resources.len() as u64;
        if count > 0 {
            let mut writer = sub.writer("Observation", self.options.writer.clone())?;
            for resource in resources {
                writer.append(&resource)?;
            }
            writer.close()?;
        }
        Ok(count)
    }

    /// Fetch referenced Medications; returns the number fetched.
    async fn fetch_medications(&self, sub: &mut SubExport, log: &EventLog) -> Result<u64> {
        let base_url = self.client.base_url().as_str().to_string();

        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for record in sub_records(sub, "MedicationRequest")? {
            if let Some(reference) = record
                .as_value()
                .pointer("/medicationReference/reference")
                .and_then(Value::as_str)
                && let Ok(parsed) = parse_reference(reference, Some(&base_url))
                && parsed.resource_type == "Medication"
            {
                referenced.insert(parsed.id);
            }
        }
        let mut present: BTreeSet<String> = BTreeSet::new();
        for record in sub_records(sub, "Medication")? {
            present.insert(record.id().to_string());
        }

        let missing: Vec<String> = referenced.difference(&present).cloned().collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let resources = self.fetch_by_id("Medication", missing, log).await?;
        let count = resources.len() as u64;
        if count > 0 {
            let mut writer = sub.writer("Medication", self.options.writer.clone())?;
            for resource in resources {
                writer.append(&resource)?;
            }
            writer.close()?;
        }
        Ok(count)
    }

    /// Fetch a batch of resources by id; 404s are logged and omitted.
    async fn fetch_by_id(
        &self,
        resource_type: &str,
        ids: Vec<String>,
        log: &EventLog,
    ) -> Result<Vec<Resource>> {
        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let client = self.client.clone();
            let scheduler = self.scheduler.clone();
            let resource_type = resource_type.to_string();
            tasks.spawn(async move {
                let _permit = scheduler.acquire(Budget::CrawlPatient).await?;
                let resource = client.read(&resource_type, &id).await?;
                Ok::<_, crate::error::EngineError>((id, resource))
            });
        }
        let mut resources = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, resource) = joined
                .map_err(|e| crate::error::EngineError::config(format!("task panicked: {e}")))??;
            match resource {
                Some(resource) => resources.push(resource),
                None => {
                    log.append(
                        &LogEvent::warn("hydrate", "referenced resource not found")
                            .resource_type(resource_type)
                            .url(format!("{resource_type}/{id}"))
                            .http_status(404),
                    )?;
                }
            }
        }
        resources.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(resources)
    }
}

/// Latest occurrence of every `(type, id)` across the given types' pages,
/// in page order so later pages supersede earlier ones.
fn load_latest(sub: &SubExport, types: &[&str]) -> Result<BTreeMap<ResourceKey, Resource>> {
    let mut latest = BTreeMap::new();
    for resource_type in types {
        for record in sub_records(sub, resource_type)? {
            latest.insert(record.key(), record);
        }
    }
    Ok(latest)
}

/// All well-formed resources of a type in a sub-export, page order.
fn sub_records(sub: &SubExport, resource_type: &str) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for page in sub.pages(resource_type)? {
        for record in read_file(&page)? {
            match record {
                Ok(record) => resources.push(record.resource),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping malformed line during hydration");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(resources)
}

/// The attachment nodes of a note-bearing resource, as
/// `(JSON pointer, node)` pairs.
fn attachments_of(resource: &Resource) -> Vec<(String, &Value)> {
    let value = resource.as_value();
    let mut found = Vec::new();
    match resource.resource_type() {
        "DocumentReference" => {
            for (i, content) in value
                .get("content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .enumerate()
            {
                if let Some(attachment) = content.get("attachment") {
                    found.push((format!("/content/{i}/attachment"), attachment));
                }
            }
        }
        "DiagnosticReport" => {
            for (i, form) in value
                .get("presentedForm")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .enumerate()
            {
                found.push((format!("/presentedForm/{i}"), form));
            }
        }
        _ => {}
    }
    found
}

/// Reference strings under `<field>[*].reference`.
fn references_at(value: &Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("reference").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect()
}

fn is_accepted_content_type(content_type: &str) -> bool {
    ACCEPTED_CONTENT_TYPES
        .iter()
        .any(|accepted| content_type.starts_with(accepted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attachments_of_document_reference() {
        let resource = Resource::new(json!({
            "resourceType": "DocumentReference",
            "id": "d1",
            "content": [
                {"attachment": {"contentType": "text/plain", "url": "Binary/b1"}},
                {"attachment": {"contentType": "application/pdf", "url": "Binary/b2"}}
            ]
        }))
        .unwrap();
        let attachments = attachments_of(&resource);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].0, "/content/0/attachment");
        assert_eq!(attachments[1].0, "/content/1/attachment");
    }

    #[test]
    fn test_attachments_of_diagnostic_report() {
        let resource = Resource::new(json!({
            "resourceType": "DiagnosticReport",
            "id": "r1",
            "presentedForm": [{"contentType": "text/html", "url": "Binary/b1"}]
        }))
        .unwrap();
        let attachments = attachments_of(&resource);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].0, "/presentedForm/0");
    }

    #[test]
    fn test_references_at() {
        let value = json!({
            "resourceType": "DiagnosticReport",
            "id": "r1",
            "result": [
                {"reference": "Observation/o1"},
                {"reference": "Observation/o2"},
                {"display": "no reference"}
            ]
        });
        assert_eq!(
            references_at(&value, "result"),
            vec!["Observation/o1", "Observation/o2"]
        );
        assert!(references_at(&value, "hasMember").is_empty());
    }

    #[test]
    fn test_accepted_content_types() {
        assert!(is_accepted_content_type("text/plain"));
        assert!(is_accepted_content_type("text/plain; charset=utf-8"));
        assert!(is_accepted_content_type("text/html"));
        assert!(!is_accepted_content_type("application/pdf"));
        assert!(!is_accepted_content_type("image/png"));
    }

    #[test]
    fn test_attachment_hash_is_base64_sha1() {
        // FHIR Attachment.hash: base64 of the SHA-1 digest of the raw body
        let body = b"hello world";
        let mut hasher = Sha1::new();
        hasher.update(body);
        let hash = BASE64.encode(hasher.finalize());
        assert_eq!(hash, "Kq5sNclPz7QV2+lfQIuc6R7oRu0=");
    }
}

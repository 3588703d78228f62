//! Export workspace and sub-export management.
//!
//! The workspace is the user-facing output directory. Each acquisition run
//! works inside a numbered sub-export directory; finalized runs are pooled
//! into the workspace root as symlinks with dense, global page numbering per
//! resource type. A `.lock` file guards against two processes working the
//! same workspace; the OS releases the advisory lock on crash.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use fhirpull_core::FhirInstant;

use crate::error::{Result, StoreError};
use crate::eventlog::EventLog;
use crate::layout::{format_page_name, format_subexport_dir, parse_page_name, parse_subexport_dir};
use crate::metadata::{Compression, ExportMode, ExportParams, Metadata};
use crate::writer::{ResourceWriter, WriterConfig, next_page_index};

const LOCK_FILE: &str = ".lock";
pub const DELETED_DIR: &str = "deleted";

/// A sub-export directory known to exist, before its metadata is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubExportRef {
    pub seq: u32,
    pub label: String,
    pub path: PathBuf,
}

impl SubExportRef {
    pub fn load_metadata(&self) -> Result<Metadata> {
        Metadata::load(&self.path)
    }
}

/// An open sub-export: the directory plus its live metadata.
#[derive(Debug)]
pub struct SubExport {
    pub seq: u32,
    pub label: String,
    pub dir: PathBuf,
    pub metadata: Metadata,
}

impl SubExport {
    pub fn dir_name(&self) -> String {
        format_subexport_dir(self.seq, &self.label)
    }

    pub fn save_metadata(&self) -> Result<()> {
        self.metadata.save(&self.dir)
    }

    pub fn event_log(&self) -> Result<EventLog> {
        EventLog::open(&self.dir)
    }

    /// A rolling writer for a resource type, starting after any pages the
    /// sub-export already holds.
    pub fn writer(&self, resource_type: &str, config: WriterConfig) -> Result<ResourceWriter> {
        let first = next_page_index(&self.dir, resource_type)?;
        Ok(ResourceWriter::new(&self.dir, resource_type, config, first))
    }

    /// Existing pages for a resource type, in page order.
    pub fn pages(&self, resource_type: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .all_pages()?
            .remove(resource_type)
            .unwrap_or_default())
    }

    /// All pages in the sub-export grouped by resource type, in page order.
    pub fn all_pages(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let mut grouped: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Some(page) = parse_page_name(name)
            {
                grouped
                    .entry(page.resource_type)
                    .or_default()
                    .push((page.index, entry.path()));
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(rt, mut pages)| {
                pages.sort_by_key(|(index, _)| *index);
                (rt, pages.into_iter().map(|(_, path)| path).collect())
            })
            .collect())
    }

    /// Write removed identifiers into `deleted/<Type>.ndjson[.gz]`,
    /// replacing any previous file for the type.
    pub fn write_deleted_ids(
        &self,
        resource_type: &str,
        ids: &[String],
        compression: Compression,
    ) -> Result<PathBuf> {
        let dir = self.dir.join(DELETED_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let ext = if compression.is_gzip() {
            "ndjson.gz"
        } else {
            "ndjson"
        };
        let path = dir.join(format!("{resource_type}.{ext}"));
        let mut body = Vec::new();
        for id in ids {
            let line = serde_json::json!({"resourceType": resource_type, "id": id});
            serde_json::to_writer(&mut body, &line)?;
            body.push(b'\n');
        }
        let bytes = if compression.is_gzip() {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&body).map_err(|e| StoreError::io(&path, e))?;
            encoder.finish().map_err(|e| StoreError::io(&path, e))?
        } else {
            body
        };
        std::fs::write(&path, bytes).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }
}

/// `--since=auto` resolution result: the transaction times of the newest
/// complete sub-export.
#[derive(Debug, Clone)]
pub struct SinceAuto {
    pub mode: ExportMode,
    pub transaction_times: BTreeMap<String, FhirInstant>,
}

impl SinceAuto {
    /// The since instant to use for a resource type. Bulk runs have a
    /// single transaction time applied to every type; crawls answer per
    /// type.
    pub fn for_type(&self, resource_type: &str) -> Option<FhirInstant> {
        match self.mode {
            ExportMode::Bulk => self.transaction_times.values().max().copied(),
            ExportMode::Crawl => self.transaction_times.get(resource_type).copied(),
        }
    }
}

/// An exclusive handle on an export workspace directory.
///
/// Dropping the workspace releases the `.lock`.
pub struct Workspace {
    root: PathBuf,
    _lock: File,
}

impl Workspace {
    /// Open (creating if needed) a workspace and take its lock.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::WorkspaceLocked { path: root.clone() })?;
        Ok(Self { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All sub-export directories, ordered by sequence number.
    pub fn list_subexports(&self) -> Result<Vec<SubExportRef>> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Some((seq, label)) = parse_subexport_dir(name)
            {
                found.push(SubExportRef {
                    seq,
                    label,
                    path: entry.path(),
                });
            }
        }
        found.sort_by_key(|s| s.seq);
        Ok(found)
    }

    /// The newest sub-export whose metadata says `complete = true`.
    pub fn latest_complete(&self) -> Result<Option<(SubExportRef, Metadata)>> {
        for sub in self.list_subexports()?.into_iter().rev() {
            match sub.load_metadata() {
                Ok(metadata) if metadata.complete => return Ok(Some((sub, metadata))),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(dir = %sub.path.display(), error = %e, "skipping unreadable sub-export metadata");
                }
            }
        }
        Ok(None)
    }

    /// Resolve `--since=auto` from the newest complete sub-export.
    pub fn since_auto(&self) -> Result<Option<SinceAuto>> {
        Ok(self.latest_complete()?.map(|(_, metadata)| SinceAuto {
            mode: metadata.params.mode,
            transaction_times: metadata.transaction_times,
        }))
    }

    /// The in-progress sub-export, if one exists: metadata present,
    /// `complete = false`, and no finish timestamp.
    pub fn in_progress(&self) -> Result<Option<(SubExportRef, Metadata)>> {
        for sub in self.list_subexports()? {
            match sub.load_metadata() {
                Ok(metadata) if !metadata.complete && metadata.finished.is_none() => {
                    return Ok(Some((sub, metadata)));
                }
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    /// Open a sub-export for the given (normalized) parameters.
    ///
    /// An in-progress sub-export with structurally equal parameters is
    /// reused; with different parameters it is an error unless `resume`
    /// explicitly claims it. Otherwise a fresh directory is created with
    /// the next sequence number.
    pub fn open_subexport(&self, params: ExportParams, resume: bool) -> Result<SubExport> {
        let params = params.normalize();

        if let Some((existing, metadata)) = self.in_progress()? {
            if metadata.params.matches(&params) || resume {
                tracing::info!(dir = %existing.path.display(), "resuming in-progress sub-export");
                return Ok(SubExport {
                    seq: existing.seq,
                    label: existing.label,
                    dir: existing.path,
                    metadata,
                });
            }
            return Err(StoreError::InProgressMismatch { dir: existing.path });
        }

        let seq = self
            .list_subexports()?
            .last()
            .map(|s| s.seq + 1)
            .unwrap_or(1);
        let label = params
            .nickname
            .clone()
            .unwrap_or_else(|| today_utc_label());
        let dir = self.root.join(format_subexport_dir(seq, &label));
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let sub = SubExport {
            seq,
            label,
            dir,
            metadata: Metadata::new(params),
        };
        sub.save_metadata()?;
        tracing::info!(dir = %sub.dir.display(), "created sub-export");
        Ok(sub)
    }

    /// Pool a finalized sub-export's pages into the workspace root.
    ///
    /// Any existing top-level symlink pointing into this sub-export is
    /// removed first (making re-pooling idempotent), then each page gets a
    /// symlink with the next dense global index for its resource type.
    pub fn pool(&self, sub: &SubExport) -> Result<()> {
        let sub_dir_name = sub.dir_name();

        // Drop stale links into this sub-export.
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let path = entry.path();
            if !path.is_symlink() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if parse_page_name(&name).is_none() {
                continue;
            }
            let target = std::fs::read_link(&path).map_err(|e| StoreError::io(&path, e))?;
            if target.starts_with(&sub_dir_name) {
                std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }

        // Current global maximum per type among the remaining links.
        let mut global_max: BTreeMap<String, u32> = BTreeMap::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if !entry.path().is_symlink() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Some(page) = parse_page_name(name)
            {
                let max = global_max.entry(page.resource_type).or_insert(0);
                *max = (*max).max(page.index);
            }
        }

        for (resource_type, pages) in sub.all_pages()? {
            let mut next = global_max.get(&resource_type).copied().unwrap_or(0) + 1;
            for page in pages {
                let Some(file_name) = page.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let gzip = file_name.ends_with(".gz");
                let link_name = format_page_name(&resource_type, next, gzip);
                let link_path = self.root.join(&link_name);
                let target = PathBuf::from(&sub_dir_name).join(file_name);
                std::os::unix::fs::symlink(&target, &link_path)
                    .map_err(|e| StoreError::io(&link_path, e))?;
                tracing::debug!(link = %link_name, target = %target.display(), "pooled page");
                next += 1;
            }
        }
        Ok(())
    }
}

fn today_utc_label() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SinceMode;
    use fhirpull_core::Resource;
    use serde_json::json;

    fn params(mode: ExportMode) -> ExportParams {
        ExportParams {
            fhir_url: "http://srv/fhir".into(),
            types: vec!["Condition".into()],
            type_filters: vec![],
            since: None,
            since_mode: SinceMode::Updated,
            mode,
            nickname: None,
            compression: Compression::None,
        }
    }

    #[test]
    fn test_open_takes_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert!(dir.path().join(".lock").exists());

        let second = Workspace::open(dir.path());
        assert!(matches!(second, Err(StoreError::WorkspaceLocked { .. })));
        drop(ws);

        // lock released on drop
        Workspace::open(dir.path()).unwrap();
    }

    #[test]
    fn test_subexport_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let mut first = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        assert_eq!(first.seq, 1);
        first.metadata.complete = true;
        first.metadata.finished = Some(fhirpull_core::now_utc());
        first.save_metadata().unwrap();

        let second = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn test_in_progress_reuse_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let first = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        let first_dir = first.dir.clone();
        drop(first);

        // same params → reused
        let again = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        assert_eq!(again.dir, first_dir);

        // different params → error
        let mut other = params(ExportMode::Crawl);
        other.types = vec!["Observation".into()];
        let result = ws.open_subexport(other.clone(), false);
        assert!(matches!(result, Err(StoreError::InProgressMismatch { .. })));

        // unless explicitly resumed
        let resumed = ws.open_subexport(other, true).unwrap();
        assert_eq!(resumed.dir, first_dir);
    }

    #[test]
    fn test_nickname_label() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let mut p = params(ExportMode::Crawl);
        p.nickname = Some("second".into());
        let sub = ws.open_subexport(p, false).unwrap();
        assert_eq!(sub.dir_name(), "001.second");
    }

    fn write_pages(sub: &SubExport, resource_type: &str, ids: &[&str]) {
        let mut writer = sub
            .writer(
                resource_type,
                WriterConfig {
                    max_page_bytes: 1,
                    compression: Compression::None,
                },
            )
            .unwrap();
        // 1-byte threshold: every record lands in its own page
        for id in ids {
            writer
                .append(
                    &Resource::new(json!({"resourceType": resource_type, "id": id})).unwrap(),
                )
                .unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_pooling_dense_global_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let mut first = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        write_pages(&first, "Condition", &["c1", "c2"]);
        first.metadata.complete = true;
        first.metadata.finished = Some(fhirpull_core::now_utc());
        first.save_metadata().unwrap();
        ws.pool(&first).unwrap();

        let link = dir.path().join("Condition.001.ndjson");
        assert!(link.is_symlink());
        assert!(link.canonicalize().unwrap().exists());
        assert!(dir.path().join("Condition.002.ndjson").is_symlink());

        // second sub-export continues global numbering
        let mut p = params(ExportMode::Crawl);
        p.nickname = Some("second".into());
        let mut second = ws.open_subexport(p, false).unwrap();
        write_pages(&second, "Condition", &["c3"]);
        second.metadata.complete = true;
        second.metadata.finished = Some(fhirpull_core::now_utc());
        second.save_metadata().unwrap();
        ws.pool(&second).unwrap();

        let link3 = dir.path().join("Condition.003.ndjson");
        assert!(link3.is_symlink());
        let target = std::fs::read_link(&link3).unwrap();
        assert_eq!(target, PathBuf::from("002.second/Condition.001.ndjson"));
    }

    #[test]
    fn test_pooling_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let sub = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        write_pages(&sub, "Condition", &["c1"]);
        ws.pool(&sub).unwrap();
        ws.pool(&sub).unwrap();

        let links: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_symlink())
            .collect();
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_since_auto_prefers_latest_complete() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let mut first = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        first
            .metadata
            .record_transaction_time("Condition", "2023-01-01T00:00:00Z".parse().unwrap());
        first.metadata.complete = true;
        first.metadata.finished = Some(fhirpull_core::now_utc());
        first.save_metadata().unwrap();

        // newer but incomplete run is ignored
        let mut second = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();
        second
            .metadata
            .record_transaction_time("Condition", "2024-01-01T00:00:00Z".parse().unwrap());
        second.metadata.finished = Some(fhirpull_core::now_utc());
        second.metadata.failed_queries = 2;
        second.save_metadata().unwrap();

        let since = ws.since_auto().unwrap().unwrap();
        assert_eq!(
            since.for_type("Condition").unwrap().to_string(),
            "2023-01-01T00:00:00Z"
        );
        assert!(since.for_type("Observation").is_none());
    }

    #[test]
    fn test_since_auto_bulk_single_time() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();

        let mut sub = ws.open_subexport(params(ExportMode::Bulk), false).unwrap();
        sub.metadata
            .record_transaction_time("Condition", "2023-06-01T00:00:00Z".parse().unwrap());
        sub.metadata.complete = true;
        sub.metadata.finished = Some(fhirpull_core::now_utc());
        sub.save_metadata().unwrap();

        let since = ws.since_auto().unwrap().unwrap();
        // bulk applies its single transaction time to every type
        assert_eq!(
            since.for_type("Observation").unwrap().to_string(),
            "2023-06-01T00:00:00Z"
        );
    }

    #[test]
    fn test_write_deleted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let sub = ws.open_subexport(params(ExportMode::Crawl), false).unwrap();

        let path = sub
            .write_deleted_ids("Patient", &["p9".into(), "p10".into()], Compression::None)
            .unwrap();
        assert!(path.ends_with("deleted/Patient.ndjson"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"p9\""));
    }
}

//! Rolling NDJSON page writer.
//!
//! One writer owns one resource type inside one sub-export. Records append
//! to the current page until the uncompressed size would cross the
//! threshold, then the page is sealed and the index rolls. Pages are built
//! under a `.tmp` name and renamed into place only after a successful
//! flush-and-fsync, so a crash never leaves a half-written page behind a
//! final name.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;

use fhirpull_core::Resource;

use crate::error::{Result, StoreError};
use crate::layout::format_page_name;
use crate::metadata::Compression;

/// Default roll threshold: 1 GiB of uncompressed NDJSON, matching common
/// bulk-export file sizes.
pub const DEFAULT_MAX_PAGE_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_page_bytes: u64,
    pub compression: Compression,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
            compression: Compression::Gzip,
        }
    }
}

enum PageSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl PageSink {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.write_all(bytes),
            Self::Gzip(w) => w.write_all(bytes),
        }
    }

    fn finish(self) -> std::io::Result<File> {
        match self {
            Self::Plain(w) => w.into_inner().map_err(|e| e.into_error()),
            Self::Gzip(w) => w.finish()?.into_inner().map_err(|e| e.into_error()),
        }
    }
}

struct OpenPage {
    tmp_path: PathBuf,
    final_path: PathBuf,
    sink: PageSink,
    uncompressed: u64,
    records: u64,
}

/// Size-bounded NDJSON writer for a single resource type.
pub struct ResourceWriter {
    dir: PathBuf,
    resource_type: String,
    config: WriterConfig,
    next_index: u32,
    open: Option<OpenPage>,
    sealed: Vec<PathBuf>,
    total_records: u64,
}

impl ResourceWriter {
    /// Create a writer whose first page gets `first_index`.
    ///
    /// Callers pass the next free page index of the sub-export so that
    /// resumed runs and hydration passes extend the numbering instead of
    /// clobbering existing pages.
    pub fn new(
        dir: impl Into<PathBuf>,
        resource_type: impl Into<String>,
        config: WriterConfig,
        first_index: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            resource_type: resource_type.into(),
            config,
            next_index: first_index.max(1),
            open: None,
            sealed: Vec::new(),
            total_records: 0,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Append one resource as an NDJSON line, rolling pages as needed.
    pub fn append(&mut self, resource: &Resource) -> Result<()> {
        let mut line = serde_json::to_vec(resource.as_value())?;
        line.push(b'\n');
        self.append_line(&line)
    }

    /// Append a pre-serialized NDJSON line (must include the trailing
    /// newline). Used by the bulk downloader, which relays server lines
    /// without reparsing them.
    pub fn append_line(&mut self, line: &[u8]) -> Result<()> {
        let needs_roll = self
            .open
            .as_ref()
            .is_some_and(|p| p.uncompressed + line.len() as u64 > self.config.max_page_bytes);
        if needs_roll {
            self.seal_open()?;
        }
        if self.open.is_none() {
            self.open_page()?;
        }
        let page = self.open.as_mut().ok_or_else(|| {
            StoreError::invalid_layout("writer page missing after open")
        })?;
        page.sink
            .write_all(line)
            .map_err(|e| StoreError::io(&page.tmp_path, e))?;
        page.uncompressed += line.len() as u64;
        page.records += 1;
        self.total_records += 1;
        Ok(())
    }

    /// Seal the current page, if any, and return all sealed page paths in
    /// index order.
    pub fn close(mut self) -> Result<Vec<PathBuf>> {
        self.seal_open()?;
        Ok(std::mem::take(&mut self.sealed))
    }

    /// Abort: drop the open page's temporary file, keep sealed pages.
    pub fn abort(mut self) -> Vec<PathBuf> {
        if let Some(page) = self.open.take() {
            let _ = std::fs::remove_file(&page.tmp_path);
        }
        std::mem::take(&mut self.sealed)
    }

    fn open_page(&mut self) -> Result<()> {
        let name = format_page_name(
            &self.resource_type,
            self.next_index,
            self.config.compression.is_gzip(),
        );
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        let buf = BufWriter::new(file);
        let sink = if self.config.compression.is_gzip() {
            PageSink::Gzip(GzEncoder::new(buf, GzLevel::default()))
        } else {
            PageSink::Plain(buf)
        };
        self.open = Some(OpenPage {
            tmp_path,
            final_path,
            sink,
            uncompressed: 0,
            records: 0,
        });
        self.next_index += 1;
        Ok(())
    }

    fn seal_open(&mut self) -> Result<()> {
        let Some(page) = self.open.take() else {
            return Ok(());
        };
        // An untouched page is dropped rather than sealed empty.
        if page.records == 0 {
            let _ = std::fs::remove_file(&page.tmp_path);
            self.next_index -= 1;
            return Ok(());
        }
        let file = page
            .sink
            .finish()
            .map_err(|e| StoreError::io(&page.tmp_path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&page.tmp_path, e))?;
        std::fs::rename(&page.tmp_path, &page.final_path)
            .map_err(|e| StoreError::io(&page.final_path, e))?;
        tracing::debug!(
            resource_type = %self.resource_type,
            path = %page.final_path.display(),
            records = page.records,
            bytes = page.uncompressed,
            "sealed NDJSON page"
        );
        self.sealed.push(page.final_path);
        Ok(())
    }
}

/// Next free page index for a resource type in a directory.
pub fn next_page_index(dir: &Path, resource_type: &str) -> Result<u32> {
    let mut max = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if let Some(name) = entry.file_name().to_str()
            && let Some(page) = crate::layout::parse_page_name(name)
            && page.resource_type == resource_type
        {
            max = max.max(page.index);
        }
    }
    Ok(max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(id: &str) -> Resource {
        Resource::new(json!({"resourceType": "Observation", "id": id})).unwrap()
    }

    fn plain_config(max: u64) -> WriterConfig {
        WriterConfig {
            max_page_bytes: max,
            compression: Compression::None,
        }
    }

    #[test]
    fn test_single_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResourceWriter::new(dir.path(), "Observation", plain_config(1 << 20), 1);
        writer.append(&resource("a")).unwrap();
        writer.append(&resource("b")).unwrap();
        let pages = writer.close().unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].ends_with("Observation.001.ndjson"));

        let contents = std::fs::read_to_string(&pages[0]).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_rolls_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        // each record is ~45 bytes; cap at 60 so the second record rolls
        let mut writer = ResourceWriter::new(dir.path(), "Observation", plain_config(60), 1);
        writer.append(&resource("aaaa")).unwrap();
        writer.append(&resource("bbbb")).unwrap();
        writer.append(&resource("cccc")).unwrap();
        let pages = writer.close().unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages[0].ends_with("Observation.001.ndjson"));
        assert!(pages[1].ends_with("Observation.002.ndjson"));
        assert!(pages[2].ends_with("Observation.003.ndjson"));

        for page in &pages {
            let contents = std::fs::read_to_string(page).unwrap();
            assert_eq!(contents.lines().count(), 1);
            let parsed: serde_json::Value =
                serde_json::from_str(contents.lines().next().unwrap()).unwrap();
            assert_eq!(parsed["resourceType"], "Observation");
        }
    }

    #[test]
    fn test_no_records_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResourceWriter::new(dir.path(), "Observation", plain_config(60), 1);
        let pages = writer.close().unwrap();
        assert!(pages.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_gzip_page_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResourceWriter::new(dir.path(), "Observation", WriterConfig::default(), 1);
        writer.append(&resource("a")).unwrap();
        let pages = writer.close().unwrap();
        assert!(pages[0].ends_with("Observation.001.ndjson.gz"));

        let file = std::fs::File::open(&pages[0]).unwrap();
        let mut decoder = flate2::read::MultiGzDecoder::new(file);
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut contents).unwrap();
        assert!(contents.contains("\"id\":\"a\""));
    }

    #[test]
    fn test_first_index_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResourceWriter::new(dir.path(), "Medication", plain_config(1 << 20), 3);
        writer.append(
            &Resource::new(json!({"resourceType": "Medication", "id": "m1"})).unwrap(),
        )
        .unwrap();
        let pages = writer.close().unwrap();
        assert!(pages[0].ends_with("Medication.003.ndjson"));
    }

    #[test]
    fn test_abort_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResourceWriter::new(dir.path(), "Observation", plain_config(60), 1);
        writer.append(&resource("a")).unwrap();
        let sealed = writer.abort();
        assert!(sealed.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_next_page_index() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_page_index(dir.path(), "Observation").unwrap(), 1);
        std::fs::write(dir.path().join("Observation.001.ndjson.gz"), b"").unwrap();
        std::fs::write(dir.path().join("Observation.002.ndjson.gz"), b"").unwrap();
        std::fs::write(dir.path().join("Patient.005.ndjson"), b"").unwrap();
        assert_eq!(next_page_index(dir.path(), "Observation").unwrap(), 3);
        assert_eq!(next_page_index(dir.path(), "Patient").unwrap(), 6);
        assert_eq!(next_page_index(dir.path(), "Condition").unwrap(), 1);
    }
}

//! Export workspace storage for fhirpull.
//!
//! A workspace is a user-facing output directory holding numbered
//! sub-export directories (one per acquisition run) and top-level symlinks
//! that pool every run's NDJSON slices under a dense, global page numbering.
//! This crate owns that layout: rolling NDJSON writers, streaming readers,
//! the `metadata.json` run record, the append-only `log.ndjson` event log,
//! and the `.lock` single-process guard.

pub mod error;
pub mod eventlog;
pub mod layout;
pub mod metadata;
pub mod reader;
pub mod workspace;
pub mod writer;

pub use error::{Result, StoreError};
pub use eventlog::{EventLog, LogEvent, LogLevel};
pub use layout::{PageName, format_page_name, parse_page_name, parse_subexport_dir};
pub use metadata::{
    CohortInfo, Compression, ExportMode, ExportParams, HydrationStatus, Metadata, SinceMode,
};
pub use reader::{NdjsonRecord, read_file, read_files};
pub use workspace::{SubExport, SubExportRef, Workspace};
pub use writer::{ResourceWriter, WriterConfig};

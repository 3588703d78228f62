//! Streaming NDJSON reader.
//!
//! Reads one or many NDJSON pages (gzipped or plain, decided by file
//! extension), yielding each record with its source position. Malformed
//! lines surface as recoverable errors in the stream; they never abort it.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use fhirpull_core::Resource;

use crate::error::{Result, StoreError};

/// One parsed NDJSON line with its provenance.
#[derive(Debug)]
pub struct NdjsonRecord {
    pub path: PathBuf,
    pub line_number: u64,
    pub resource: Resource,
}

/// Iterator over the records of a single NDJSON file.
pub struct FileRecords {
    path: PathBuf,
    lines: std::io::Lines<BufReader<Box<dyn Read + Send>>>,
    line_number: u64,
}

impl Iterator for FileRecords {
    type Item = Result<NdjsonRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(StoreError::io(&self.path, e))),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str(&line)
                .map_err(|e| e.to_string())
                .and_then(|v| Resource::new(v).map_err(|e| e.to_string()));
            return Some(match parsed {
                Ok(resource) => Ok(NdjsonRecord {
                    path: self.path.clone(),
                    line_number: self.line_number,
                    resource,
                }),
                Err(message) => Err(StoreError::Parse {
                    path: self.path.clone(),
                    line: self.line_number,
                    message,
                }),
            });
        }
    }
}

/// Open a single NDJSON file, transparently decompressing `.gz`.
pub fn read_file(path: &Path) -> Result<FileRecords> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let reader: Box<dyn Read + Send> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(FileRecords {
        path: path.to_path_buf(),
        lines: BufReader::new(reader).lines(),
        line_number: 0,
    })
}

/// Chain several NDJSON files into one record stream. Files that fail to
/// open surface a single error item and the stream moves on.
pub fn read_files(paths: Vec<PathBuf>) -> impl Iterator<Item = Result<NdjsonRecord>> {
    paths.into_iter().flat_map(|path| match read_file(&path) {
        Ok(records) => Box::new(records) as Box<dyn Iterator<Item = Result<NdjsonRecord>>>,
        Err(e) => Box::new(std::iter::once(Err(e))),
    })
}

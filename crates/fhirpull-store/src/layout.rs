//! File and directory naming for export workspaces.
//!
//! Sub-exports are `NNN.<label>` directories; NDJSON slices are
//! `<ResourceType>.<PPP>.ndjson[.gz]` with 3-digit page indexes. The same
//! page pattern is reused for the workspace-level pooled symlinks, where the
//! index is global across all sub-exports.

/// A parsed NDJSON page file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageName {
    pub resource_type: String,
    pub index: u32,
    pub gzip: bool,
}

/// Format `<ResourceType>.<NNN>.ndjson[.gz]`.
pub fn format_page_name(resource_type: &str, index: u32, gzip: bool) -> String {
    let ext = if gzip { "ndjson.gz" } else { "ndjson" };
    format!("{resource_type}.{index:03}.{ext}")
}

/// Parse a page file name; `None` when the name does not match the pattern.
pub fn parse_page_name(name: &str) -> Option<PageName> {
    let (stem, gzip) = match name.strip_suffix(".ndjson.gz") {
        Some(stem) => (stem, true),
        None => (name.strip_suffix(".ndjson")?, false),
    };
    let (resource_type, index) = stem.rsplit_once('.')?;
    if resource_type.is_empty() || index.len() != 3 {
        return None;
    }
    let index: u32 = index.parse().ok()?;
    if !resource_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
    {
        return None;
    }
    Some(PageName {
        resource_type: resource_type.to_string(),
        index,
        gzip,
    })
}

/// Format a sub-export directory name, `NNN.<label>`.
pub fn format_subexport_dir(seq: u32, label: &str) -> String {
    format!("{seq:03}.{label}")
}

/// Parse a sub-export directory name into `(sequence, label)`.
pub fn parse_subexport_dir(name: &str) -> Option<(u32, String)> {
    let (seq, label) = name.split_once('.')?;
    if seq.len() != 3 || label.is_empty() {
        return None;
    }
    let seq: u32 = seq.parse().ok()?;
    Some((seq, label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_name_roundtrip() {
        assert_eq!(
            format_page_name("Observation", 1, true),
            "Observation.001.ndjson.gz"
        );
        assert_eq!(format_page_name("Patient", 12, false), "Patient.012.ndjson");

        let parsed = parse_page_name("Observation.001.ndjson.gz").unwrap();
        assert_eq!(
            parsed,
            PageName {
                resource_type: "Observation".into(),
                index: 1,
                gzip: true
            }
        );

        let parsed = parse_page_name("Patient.012.ndjson").unwrap();
        assert!(!parsed.gzip);
        assert_eq!(parsed.index, 12);
    }

    #[test]
    fn test_page_name_rejects_non_pages() {
        assert!(parse_page_name("metadata.json").is_none());
        assert!(parse_page_name("log.ndjson").is_none());
        assert!(parse_page_name("Patient.1.ndjson").is_none());
        assert!(parse_page_name("patient.001.ndjson").is_none());
        assert!(parse_page_name(".001.ndjson").is_none());
    }

    #[test]
    fn test_subexport_dir_roundtrip() {
        assert_eq!(format_subexport_dir(1, "2026-08-01"), "001.2026-08-01");
        assert_eq!(
            parse_subexport_dir("001.2026-08-01"),
            Some((1, "2026-08-01".to_string()))
        );
        assert_eq!(
            parse_subexport_dir("002.second"),
            Some((2, "second".to_string()))
        );
    }

    #[test]
    fn test_subexport_dir_rejects_other_entries() {
        assert!(parse_subexport_dir(".lock").is_none());
        assert!(parse_subexport_dir("Patient.001.ndjson").is_none());
        assert!(parse_subexport_dir("1.label").is_none());
        assert!(parse_subexport_dir("abc.label").is_none());
    }

    #[test]
    fn test_label_with_dots() {
        // labels keep everything after the first dot
        assert_eq!(
            parse_subexport_dir("003.v1.2-rerun"),
            Some((3, "v1.2-rerun".to_string()))
        );
    }
}

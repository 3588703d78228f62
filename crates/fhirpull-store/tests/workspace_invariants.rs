//! Whole-workspace invariant tests: dense global page numbering, symlink
//! validity, and page-roll behavior across sub-exports.

use serde_json::json;

use fhirpull_core::Resource;
use fhirpull_store::{
    Compression, ExportMode, ExportParams, SinceMode, Workspace, WriterConfig, parse_page_name,
};

fn params(nickname: Option<&str>) -> ExportParams {
    ExportParams {
        fhir_url: "http://srv/fhir".into(),
        types: vec!["Observation".into()],
        type_filters: vec![],
        since: None,
        since_mode: SinceMode::Updated,
        mode: ExportMode::Crawl,
        nickname: nickname.map(ToString::to_string),
        compression: Compression::None,
    }
}

fn finish(sub: &mut fhirpull_store::SubExport) {
    sub.metadata.complete = true;
    sub.metadata.finished = Some(fhirpull_core::now_utc());
    sub.save_metadata().unwrap();
}

fn observation(id: &str) -> Resource {
    Resource::new(json!({"resourceType": "Observation", "id": id})).unwrap()
}

#[test]
fn global_numbering_is_dense_across_sub_exports() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::open(dir.path()).unwrap();

    // three sub-exports producing 2, 1 and 3 pages respectively
    for (nickname, ids) in [
        ("one", vec!["a", "b"]),
        ("two", vec!["c"]),
        ("three", vec!["d", "e", "f"]),
    ] {
        let mut sub = workspace.open_subexport(params(Some(nickname)), false).unwrap();
        let mut writer = sub
            .writer(
                "Observation",
                WriterConfig {
                    // tiny threshold: one record per page
                    max_page_bytes: 1,
                    compression: Compression::None,
                },
            )
            .unwrap();
        for id in ids {
            writer.append(&observation(id)).unwrap();
        }
        writer.close().unwrap();
        finish(&mut sub);
        workspace.pool(&sub).unwrap();
    }

    // every top-level page is a symlink resolving to an existing file
    let mut indexes: Vec<u32> = Vec::new();
    for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
        let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
            continue;
        };
        let Some(page) = parse_page_name(&name) else {
            continue;
        };
        assert!(entry.path().is_symlink());
        assert!(entry.path().canonicalize().unwrap().is_file());
        assert_eq!(page.resource_type, "Observation");
        indexes.push(page.index);
    }
    indexes.sort_unstable();

    // dense from 001, strictly increasing
    assert_eq!(indexes, (1..=6).collect::<Vec<u32>>());
}

#[test]
fn page_roll_at_threshold_yields_two_valid_pages() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::open(dir.path()).unwrap();
    let sub = workspace.open_subexport(params(None), false).unwrap();

    let line_len = serde_json::to_vec(observation("x1").as_value()).unwrap().len() + 1;
    let mut writer = sub
        .writer(
            "Observation",
            WriterConfig {
                // exactly one line fits per page
                max_page_bytes: line_len as u64,
                compression: Compression::None,
            },
        )
        .unwrap();
    writer.append(&observation("x1")).unwrap();
    writer.append(&observation("x2")).unwrap();
    let pages = writer.close().unwrap();
    assert_eq!(pages.len(), 2);

    for page in &pages {
        let contents = std::fs::read_to_string(page).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(value["resourceType"], "Observation");
    }
}

#[test]
fn only_one_sub_export_is_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::open(dir.path()).unwrap();

    let first = workspace.open_subexport(params(Some("one")), false).unwrap();
    // a second run with other params cannot open a second in-progress dir
    let mut other = params(Some("two"));
    other.types = vec!["Condition".into()];
    assert!(workspace.open_subexport(other, false).is_err());

    drop(first);
    let (in_progress, _) = workspace.in_progress().unwrap().unwrap();
    assert_eq!(in_progress.seq, 1);
}

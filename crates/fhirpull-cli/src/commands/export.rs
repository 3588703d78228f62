use std::str::FromStr;

use url::Url;

use fhirpull_core::FhirInstant;
use fhirpull_engine::cohort::CohortSource;
use fhirpull_engine::{EngineError, ExportRequest, ModeArg, Result, SinceArg, run_export};
use fhirpull_store::{Compression, SinceMode, Workspace};

use crate::cli::{Cli, CompressionArg, ExportArgs, ExportModeArg, SinceModeArg};
use crate::config;
use crate::output;

pub async fn run(cli: &Cli, args: &ExportArgs, mode_override: Option<ModeArg>) -> Result<i32> {
    let fhir_url = config::resolve_fhir_url(&cli.fhir_url, &cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;
    let fhir_url = Url::parse(&fhir_url)
        .map_err(|e| EngineError::config(format!("invalid --fhir-url: {e}")))?;
    let profile = config::load_profile(&cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;

    let client = super::build_client(&fhir_url, &args.auth, &profile).await?;
    let scheduler = super::build_scheduler(&args.budgets);
    let workspace = Workspace::open(&args.dir)?;

    let mut request = ExportRequest::new(fhir_url);
    request.mode = mode_override.unwrap_or(match args.export_mode {
        ExportModeArg::Auto => ModeArg::Auto,
        ExportModeArg::Bulk => ModeArg::Bulk,
        ExportModeArg::Crawl => ModeArg::Crawl,
    });
    request.types = args.types.clone();
    request.type_filters = args.type_filters.clone();
    request.since = parse_since(args.since.as_deref())?;
    request.since_mode = args.since_mode.map(|m| match m {
        SinceModeArg::Updated => SinceMode::Updated,
        SinceModeArg::Created => SinceMode::Created,
    });
    request.cohort = cohort_source(args)?;
    request.id_system = args.id_system.clone();
    request.nickname = args.nickname.clone();
    request.compression = match args.compression {
        CompressionArg::Gzip => Compression::Gzip,
        CompressionArg::None => Compression::None,
    };
    request.default_filters = !args.no_default_filters;
    request.resume = args.resume;
    request.hydrate = !args.no_hydrate;
    if let Some(max) = args.max_page_bytes {
        request.max_page_bytes = max;
    }

    let outcome = run_export(&client, &scheduler, &workspace, request).await?;

    if outcome.no_op {
        output::print_success(&format!(
            "nothing to do: sub-export {:03} already covers these parameters",
            outcome.seq
        ));
    } else if outcome.complete {
        output::print_success(&format!("export complete in sub-export {:03}", outcome.seq));
    } else {
        output::print_warning(&format!(
            "export finished with {} failed queries (sub-export {:03} marked incomplete); \
             re-run with the same parameters to retry",
            outcome.failed_queries, outcome.seq
        ));
    }
    Ok(0)
}

fn parse_since(since: Option<&str>) -> Result<SinceArg> {
    match since {
        None => Ok(SinceArg::None),
        Some("auto") => Ok(SinceArg::Auto),
        Some(value) => FhirInstant::from_str(value)
            .map(SinceArg::At)
            .map_err(|e| EngineError::config(format!("invalid --since: {e}"))),
    }
}

/// Pick the cohort source by priority: id-list, id-file, source-dir,
/// group. The inputs are mutually exclusive; extras are rejected.
fn cohort_source(args: &ExportArgs) -> Result<Option<CohortSource>> {
    let given = [
        args.id_list.is_some(),
        args.id_file.is_some(),
        args.source_dir.is_some(),
        args.group.is_some(),
    ]
    .iter()
    .filter(|given| **given)
    .count();
    if given > 1 {
        return Err(EngineError::config(
            "--id-list, --id-file, --source-dir and --group are mutually exclusive",
        ));
    }

    if let Some(ids) = &args.id_list {
        return Ok(Some(CohortSource::IdList(ids.clone())));
    }
    if let Some(path) = &args.id_file {
        return Ok(Some(CohortSource::IdFile(path.clone())));
    }
    if let Some(dir) = &args.source_dir {
        return Ok(Some(CohortSource::SourceDir(dir.clone())));
    }
    if let Some(group) = &args.group {
        return Ok(Some(CohortSource::Group(group.clone())));
    }
    Ok(None)
}

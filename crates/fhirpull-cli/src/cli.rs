use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fhirpull")]
#[command(about = "fhirpull — export FHIR R4 clinical data from EHR servers to NDJSON")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// FHIR server base URL (overrides config and FHIRPULL_URL env var)
    #[arg(long, global = true, env = "FHIRPULL_URL")]
    pub fhir_url: Option<String>,

    /// Config profile name
    #[arg(short, long, global = true, env = "FHIRPULL_PROFILE", default_value = "default")]
    pub profile: String,

    /// Verbose logging (equivalent to RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export clinical data, choosing bulk or crawl from server capabilities
    Export(ExportArgs),
    /// Export via the Bulk Data $export operation
    Bulk(ExportArgs),
    /// Export via per-patient crawl searches
    Crawl(ExportArgs),
    /// Post-process a finished export: inline notes, fetch missing
    /// Observations and referenced Medications
    Hydrate(HydrateArgs),
    /// Fetch a single resource by reference (e.g. Patient/123)
    Single(SingleArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum ExportModeArg {
    #[default]
    Auto,
    Bulk,
    Crawl,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SinceModeArg {
    Updated,
    Created,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum CompressionArg {
    #[default]
    Gzip,
    None,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TaskArg {
    Attachments,
    Observations,
    Medications,
}

#[derive(clap::Args)]
pub struct ExportArgs {
    /// Output workspace directory
    pub dir: PathBuf,

    /// Server-side FHIR Group id defining the cohort
    #[arg(long)]
    pub group: Option<String>,

    /// Comma-separated identifier values defining the cohort
    #[arg(long, value_delimiter = ',')]
    pub id_list: Option<Vec<String>>,

    /// File of identifiers: newline list or CSV with an ID/MRN column
    #[arg(long)]
    pub id_file: Option<PathBuf>,

    /// Reuse the Patient NDJSON of another workspace as the cohort
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Identifier system; values resolve via Patient?identifier=system|value
    #[arg(long)]
    pub id_system: Option<String>,

    /// Resource types to export (comma-separated, repeatable)
    #[arg(long = "type", value_delimiter = ',')]
    pub types: Vec<String>,

    /// Search filter Type?query; repeatable, results are unioned
    #[arg(long = "type-filter")]
    pub type_filters: Vec<String>,

    /// Lower bound instant, or "auto" to continue from the last complete
    /// export
    #[arg(long)]
    pub since: Option<String>,

    /// Which resource date --since applies to (default: from capabilities)
    #[arg(long)]
    pub since_mode: Option<SinceModeArg>,

    /// Acquisition mode
    #[arg(long, default_value = "auto")]
    pub export_mode: ExportModeArg,

    /// Label for the sub-export directory instead of today's date
    #[arg(long)]
    pub nickname: Option<String>,

    /// NDJSON compression
    #[arg(long, default_value = "gzip")]
    pub compression: CompressionArg,

    /// Drop the standard Observation category filter
    #[arg(long)]
    pub no_default_filters: bool,

    /// Claim the in-progress sub-export even if its parameters differ
    #[arg(long)]
    pub resume: bool,

    /// Skip the hydration stage
    #[arg(long)]
    pub no_hydrate: bool,

    /// Maximum uncompressed bytes per NDJSON page
    #[arg(long)]
    pub max_page_bytes: Option<u64>,

    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(flatten)]
    pub budgets: BudgetArgs,
}

#[derive(clap::Args)]
pub struct AuthArgs {
    /// Private key for SMART backend services (PEM, JWK or JWKS file)
    #[arg(long)]
    pub jwks: Option<PathBuf>,

    /// OAuth client id registered with the EHR
    #[arg(long)]
    pub client_id: Option<String>,

    /// OAuth scope to request (default: system/*.read)
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(clap::Args)]
pub struct BudgetArgs {
    /// Concurrent bulk file downloads
    #[arg(long)]
    pub bulk_concurrency: Option<usize>,

    /// Patients in flight during a crawl
    #[arg(long)]
    pub patient_concurrency: Option<usize>,

    /// Resource-type queries in flight per patient
    #[arg(long)]
    pub type_concurrency: Option<usize>,

    /// Concurrent attachment downloads during hydration
    #[arg(long)]
    pub attachment_concurrency: Option<usize>,
}

#[derive(clap::Args)]
pub struct HydrateArgs {
    /// Workspace directory holding the export to hydrate
    pub dir: PathBuf,

    /// Re-run tasks that are already marked complete
    #[arg(long)]
    pub force: bool,

    /// Run only the named tasks (repeatable; default: all)
    #[arg(long = "task")]
    pub tasks: Vec<TaskArg>,

    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(flatten)]
    pub budgets: BudgetArgs,
}

#[derive(clap::Args)]
pub struct SingleArgs {
    /// Resource reference (e.g. Patient/123)
    pub reference: String,

    /// Write the resource here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub auth: AuthArgs,
}

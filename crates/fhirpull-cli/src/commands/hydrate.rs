use url::Url;

use fhirpull_engine::{EngineError, HydrateOptions, HydrationTask, Result, run_hydrate};
use fhirpull_store::Workspace;

use crate::cli::{Cli, HydrateArgs, TaskArg};
use crate::config;
use crate::output;

pub async fn run(cli: &Cli, args: &HydrateArgs) -> Result<i32> {
    let fhir_url = config::resolve_fhir_url(&cli.fhir_url, &cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;
    let fhir_url = Url::parse(&fhir_url)
        .map_err(|e| EngineError::config(format!("invalid --fhir-url: {e}")))?;
    let profile = config::load_profile(&cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;

    let client = super::build_client(&fhir_url, &args.auth, &profile).await?;
    let scheduler = super::build_scheduler(&args.budgets);
    let workspace = Workspace::open(&args.dir)?;

    let tasks: Vec<HydrationTask> = if args.tasks.is_empty() {
        HydrationTask::all().to_vec()
    } else {
        args.tasks
            .iter()
            .map(|t| match t {
                TaskArg::Attachments => HydrationTask::Attachments,
                TaskArg::Observations => HydrationTask::Observations,
                TaskArg::Medications => HydrationTask::Medications,
            })
            .collect()
    };

    let seq = run_hydrate(
        &client,
        &scheduler,
        &workspace,
        HydrateOptions {
            tasks,
            force: args.force,
            ..HydrateOptions::default()
        },
    )
    .await?;

    output::print_success(&format!("hydration complete for sub-export {seq:03}"));
    Ok(0)
}

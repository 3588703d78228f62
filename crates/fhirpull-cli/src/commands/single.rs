use url::Url;

use fhirpull_core::parse_reference;
use fhirpull_engine::{EngineError, Result};

use crate::cli::{Cli, SingleArgs};
use crate::config;
use crate::output;

pub async fn run(cli: &Cli, args: &SingleArgs) -> Result<i32> {
    let fhir_url = config::resolve_fhir_url(&cli.fhir_url, &cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;
    let fhir_url = Url::parse(&fhir_url)
        .map_err(|e| EngineError::config(format!("invalid --fhir-url: {e}")))?;
    let profile = config::load_profile(&cli.profile)
        .map_err(|e| EngineError::config(e.to_string()))?;

    let reference = parse_reference(&args.reference, Some(fhir_url.as_str()))
        .map_err(|e| EngineError::config(format!("invalid reference: {e}")))?;

    let client = super::build_client(&fhir_url, &args.auth, &profile).await?;
    let resource = client
        .read(&reference.resource_type, &reference.id)
        .await?
        .ok_or_else(|| {
            EngineError::Client(fhirpull_client::ClientError::Status {
                status: 404,
                url: format!("{}/{}", fhir_url.as_str().trim_end_matches('/'), reference),
                diagnostics: Some(format!("{reference} not found on the server")),
            })
        })?;

    let pretty = serde_json::to_string_pretty(resource.as_value())
        .map_err(|e| EngineError::config(e.to_string()))?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{pretty}\n"))
                .map_err(|e| EngineError::config(format!("cannot write {}: {e}", path.display())))?;
            output::print_success(&format!("wrote {} to {}", reference, path.display()));
        }
        None => println!("{pretty}"),
    }
    Ok(0)
}

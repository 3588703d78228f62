pub mod export;
pub mod hydrate;
pub mod single;

use fhirpull_client::{BackendServicesConfig, FhirClient, TokenManager, discover_token_endpoint};
use fhirpull_engine::{Budgets, EngineError, Result, Scheduler};
use url::Url;

use crate::cli::{AuthArgs, BudgetArgs};
use crate::config::ProfileConfig;

/// Build the FHIR client, wiring up backend-services auth when a signing
/// key is configured via flags or the profile.
pub(crate) async fn build_client(
    fhir_url: &Url,
    auth: &AuthArgs,
    profile: &ProfileConfig,
) -> Result<FhirClient> {
    let jwks = auth.jwks.clone().or_else(|| profile.jwks.clone());
    let client_id = auth.client_id.clone().or_else(|| profile.client_id.clone());

    let mut builder = FhirClient::builder(fhir_url.clone());
    if let Some(jwks) = jwks {
        let Some(client_id) = client_id else {
            return Err(EngineError::config(
                "--client-id is required when a signing key is configured",
            ));
        };
        let http = reqwest::Client::new();
        let token_endpoint = discover_token_endpoint(&http, fhir_url).await?;
        let scope = auth
            .scope
            .clone()
            .or_else(|| profile.scope.clone())
            .unwrap_or_else(|| "system/*.read".to_string());
        let manager = TokenManager::from_key_file(
            http,
            BackendServicesConfig {
                client_id,
                scope,
                token_endpoint,
            },
            &jwks,
        )?;
        builder = builder.auth(manager);
    }
    builder.build().map_err(Into::into)
}

/// Build the scheduler from the budget flags and hook it to SIGINT/SIGTERM.
pub(crate) fn build_scheduler(budgets: &BudgetArgs) -> Scheduler {
    let defaults = Budgets::default();
    let scheduler = Scheduler::new(Budgets {
        bulk_download: budgets.bulk_concurrency.unwrap_or(defaults.bulk_download),
        crawl_patients: budgets
            .patient_concurrency
            .unwrap_or(defaults.crawl_patients),
        crawl_types: budgets.type_concurrency.unwrap_or(defaults.crawl_types),
        attachments: budgets
            .attachment_concurrency
            .unwrap_or(defaults.attachments),
    });
    install_signal_handler(&scheduler);
    scheduler
}

fn install_signal_handler(scheduler: &Scheduler) {
    let scheduler = scheduler.clone();
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        tracing::warn!("shutdown signal received, finishing in-flight writes");
        scheduler.cancel();
    });
}

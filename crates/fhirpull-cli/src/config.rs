use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    pub fhir_url: Option<String>,
    pub client_id: Option<String>,
    pub jwks: Option<PathBuf>,
    pub scope: Option<String>,
}

pub type ConfigFile = HashMap<String, ProfileConfig>;

fn config_path() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("Cannot determine home directory")?
        .join(".fhirpull");
    fs::create_dir_all(&dir)?;
    Ok(dir.join("config.toml"))
}

pub fn load_profile(profile: &str) -> Result<ProfileConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(ProfileConfig::default());
    }
    let content = fs::read_to_string(&path)?;
    let mut all: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Malformed config file {}", path.display()))?;
    Ok(all.remove(profile).unwrap_or_default())
}

pub fn resolve_fhir_url(cli_url: &Option<String>, profile: &str) -> Result<String> {
    // 1. --fhir-url flag / FHIRPULL_URL env
    if let Some(url) = cli_url {
        return Ok(url.clone());
    }
    // 2. config.toml profile
    let cfg = load_profile(profile)?;
    if let Some(url) = cfg.fhir_url {
        return Ok(url);
    }
    anyhow::bail!(
        "No FHIR server URL configured. Use --fhir-url, set the FHIRPULL_URL env var, \
         or add fhir_url to ~/.fhirpull/config.toml"
    )
}

//! SMART Backend Services authentication.
//!
//! Implements the client side of the OAuth 2.0 client-credentials flow with
//! a JWT bearer assertion per RFC 7523: the client signs an assertion with
//! its private key (`iss` = `sub` = client id, `aud` = token endpoint,
//! unique `jti`, `exp` at most 5 minutes out) and exchanges it for a bearer
//! token. Tokens are cached and refreshed shortly before expiry; a 401 from
//! the server invalidates the cache so the next request re-authenticates.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::EncodePrivateKey;
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{ClientError, Result};

/// How long a signed assertion stays valid. Five minutes is the maximum the
/// SMART spec allows.
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Refresh the cached token this long before it actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Configuration for backend-services authentication.
#[derive(Debug, Clone)]
pub struct BackendServicesConfig {
    /// OAuth client id registered with the EHR.
    pub client_id: String,
    /// Requested scope.
    pub scope: String,
    /// Token endpoint; discovered from the server when not set explicitly.
    pub token_endpoint: Url,
}

/// JWT claims for the client assertion per RFC 7523.
#[derive(Debug, Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    jti: String,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
struct SmartConfiguration {
    token_endpoint: String,
}

/// Signs client assertions with the configured private key.
struct AssertionSigner {
    key: EncodingKey,
    kid: Option<String>,
}

impl AssertionSigner {
    fn sign(&self, client_id: &str, token_endpoint: &str) -> Result<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_endpoint.to_string(),
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
        };
        let mut header = Header::new(Algorithm::RS384);
        header.kid = self.kid.clone();
        jsonwebtoken::encode(&header, &claims, &self.key)
            .map_err(|e| ClientError::Auth(format!("failed to sign client assertion: {e}")))
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Caches and refreshes bearer tokens for a single client registration.
///
/// Cloneable and cheap to share; the token cache lives behind a mutex so
/// concurrent tasks trigger at most one refresh at a time.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

struct TokenManagerInner {
    http: reqwest::Client,
    config: BackendServicesConfig,
    signer: AssertionSigner,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    /// Build a token manager from a private key file.
    ///
    /// The key file may be a PEM-encoded RSA private key, a single JSON Web
    /// Key, or a JWKS document whose first RSA signing key is used.
    pub fn from_key_file(
        http: reqwest::Client,
        config: BackendServicesConfig,
        key_path: &Path,
    ) -> Result<Self> {
        let contents = std::fs::read_to_string(key_path).map_err(|e| {
            ClientError::Auth(format!("cannot read key file {}: {e}", key_path.display()))
        })?;
        let signer = load_signer(&contents)?;
        Ok(Self {
            inner: Arc::new(TokenManagerInner {
                http,
                config,
                signer,
                cached: Mutex::new(None),
            }),
        })
    }

    /// Return a bearer token, refreshing if the cached one is near expiry.
    pub async fn bearer(&self) -> Result<String> {
        let mut cached = self.inner.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + EXPIRY_MARGIN
        {
            return Ok(token.access_token.clone());
        }

        let token = self.exchange().await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    /// Drop the cached token so the next request re-authenticates.
    pub async fn invalidate(&self) {
        self.inner.cached.lock().await.take();
    }

    async fn exchange(&self) -> Result<CachedToken> {
        let config = &self.inner.config;
        let endpoint = config.token_endpoint.as_str();
        let assertion = self.inner.signer.sign(&config.client_id, endpoint)?;

        let params = [
            ("grant_type", "client_credentials"),
            ("scope", config.scope.as_str()),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
            ),
            ("client_assertion", assertion.as_str()),
        ];

        let response = self
            .inner
            .http
            .post(config.token_endpoint.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| ClientError::Auth(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Auth(format!("malformed token response: {e}")))?;

        tracing::debug!(expires_in = token.expires_in, "obtained access token");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

/// Discover the token endpoint from `.well-known/smart-configuration`.
pub async fn discover_token_endpoint(http: &reqwest::Client, fhir_url: &Url) -> Result<Url> {
    let base = fhir_url.as_str().trim_end_matches('/');
    let well_known = Url::parse(&format!("{base}/.well-known/smart-configuration"))?;

    let response = http
        .get(well_known.clone())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| ClientError::Auth(format!("smart-configuration unreachable: {e}")))?;

    if !response.status().is_success() {
        return Err(ClientError::Auth(format!(
            "smart-configuration returned HTTP {} at {well_known}",
            response.status().as_u16()
        )));
    }

    let config: SmartConfiguration = response
        .json()
        .await
        .map_err(|e| ClientError::Auth(format!("malformed smart-configuration: {e}")))?;

    Url::parse(&config.token_endpoint).map_err(Into::into)
}

fn load_signer(contents: &str) -> Result<AssertionSigner> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with("-----BEGIN") {
        let key = EncodingKey::from_rsa_pem(contents.as_bytes())
            .map_err(|e| ClientError::Auth(format!("invalid PEM private key: {e}")))?;
        return Ok(AssertionSigner { key, kid: None });
    }

    let json: serde_json::Value = serde_json::from_str(contents)
        .map_err(|e| ClientError::Auth(format!("key file is neither PEM nor JSON: {e}")))?;

    // Either a bare JWK or a JWKS with a "keys" array.
    let jwk = match json.get("keys").and_then(|k| k.as_array()) {
        Some(keys) => keys
            .iter()
            .find(|k| k.get("kty").and_then(|v| v.as_str()) == Some("RSA"))
            .ok_or_else(|| ClientError::Auth("no RSA key found in JWKS".into()))?,
        None => &json,
    };

    if jwk.get("kty").and_then(|v| v.as_str()) != Some("RSA") {
        return Err(ClientError::Auth(
            "only RSA (RS384) signing keys are supported".into(),
        ));
    }

    let kid = jwk
        .get("kid")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let key = rsa_key_from_jwk(jwk)?;
    Ok(AssertionSigner { key, kid })
}

/// Reassemble an RSA private key from its JWK parameters.
fn rsa_key_from_jwk(jwk: &serde_json::Value) -> Result<EncodingKey> {
    let field = |name: &str| -> Result<BigUint> {
        let value = jwk
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Auth(format!("JWK is missing private field '{name}'")))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| ClientError::Auth(format!("JWK field '{name}' is not base64url: {e}")))?;
        Ok(BigUint::from_bytes_be(&bytes))
    };

    let n = field("n")?;
    let e = field("e")?;
    let d = field("d")?;
    let p = field("p")?;
    let q = field("q")?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| ClientError::Auth(format!("invalid RSA key components: {e}")))?;
    let pem = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| ClientError::Auth(format!("failed to encode RSA key: {e}")))?;

    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| ClientError::Auth(format!("failed to load RSA key: {e}")))
}

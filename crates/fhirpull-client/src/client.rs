use std::time::Duration;

use rand::Rng;
use reqwest::{Method, RequestBuilder, Response, StatusCode, redirect};
use serde_json::Value;
use url::Url;

use fhirpull_core::Resource;

use crate::auth::TokenManager;
use crate::error::{ClientError, Result};

const FHIR_JSON: &str = "application/fhir+json";
const FHIR_NDJSON: &str = "application/fhir+ndjson";

/// Retry behavior for transient failures (connect errors, 5xx, 429/503).
///
/// All constants are injectable so tests never sleep on real backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum total attempts per request, first try included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// Apply full jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries and no sleeping; useful in tests.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Exponential backoff for the given zero-based retry index.
    fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter && !exp.is_zero() {
            let millis = exp.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        } else {
            exp
        }
    }
}

/// Authenticated FHIR REST client.
///
/// One instance is shared across the whole run; it owns the HTTP connection
/// pool and the token cache. All request paths funnel through [`execute`],
/// which applies the response disposition rules: 2xx success, up to ten
/// redirects (delegated to reqwest), a single re-auth on 401, `Retry-After`
/// on 429/503, retry-then-fail on 5xx and transport errors, and other 4xx
/// surfaced with OperationOutcome diagnostics when the server provides
/// them. A 410 on the bulk status URL means the export expired; that
/// reading belongs to the bulk exporter, which maps it from the plain 410
/// status error itself.
///
/// [`execute`]: FhirClient::execute
#[derive(Clone)]
pub struct FhirClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Option<TokenManager>,
    retry: RetryPolicy,
}

pub struct FhirClientBuilder {
    base_url: Url,
    auth: Option<TokenManager>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl FhirClientBuilder {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            auth: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(300),
        }
    }

    pub fn auth(mut self, auth: TokenManager) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<FhirClient> {
        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::limited(10))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ClientError::invalid_response(self.base_url.as_str(), e.to_string()))?;
        Ok(FhirClient {
            http,
            base_url: self.base_url,
            auth: self.auth,
            retry: self.retry,
        })
    }
}

impl FhirClient {
    pub fn builder(base_url: Url) -> FhirClientBuilder {
        FhirClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Resolve a relative FHIR path (`Patient/123`, `metadata`) against the
    /// server base.
    pub fn absolute(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(Into::into)
    }

    /// Run a request through the retry/auth loop and return the raw response.
    ///
    /// Any 2xx response is returned as-is, so callers can inspect headers of
    /// 202 kickoff/polling replies. Everything else becomes a
    /// [`ClientError`].
    pub async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let mut reauthed = false;
        let mut last_error = String::new();
        let mut url_hint = String::new();

        for attempt in 0..self.retry.max_attempts {
            let Some(mut req) = request.try_clone() else {
                return Err(ClientError::invalid_response(
                    self.base_url.as_str(),
                    "request body is not retryable",
                ));
            };
            if let Some(auth) = &self.auth {
                req = req.bearer_auth(auth.bearer().await?);
            }

            let response = match req.send().await {
                Ok(response) => response,
                Err(e) => {
                    url_hint = e
                        .url()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| self.base_url.to_string());
                    if attempt + 1 == self.retry.max_attempts {
                        return Err(ClientError::Transport {
                            url: url_hint,
                            source: e,
                        });
                    }
                    last_error = e.to_string();
                    tracing::debug!(attempt, error = %last_error, "transport error, backing off");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status();
            url_hint = response.url().to_string();

            if status.is_success() {
                return Ok(response);
            }

            match status {
                StatusCode::UNAUTHORIZED if !reauthed && self.auth.is_some() => {
                    if let Some(auth) = &self.auth {
                        auth.invalidate().await;
                    }
                    reauthed = true;
                    tracing::debug!(url = %url_hint, "401 response, re-authenticating once");
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    let delay = retry_after(&response).unwrap_or_else(|| self.retry.backoff(attempt));
                    last_error = format!("HTTP {}", status.as_u16());
                    if attempt + 1 == self.retry.max_attempts {
                        break;
                    }
                    tracing::debug!(url = %url_hint, status = status.as_u16(), ?delay, "rate limited, waiting");
                    tokio::time::sleep(delay.min(self.retry.max_delay)).await;
                    continue;
                }
                s if s.is_server_error() => {
                    last_error = format!("HTTP {}", s.as_u16());
                    if attempt + 1 == self.retry.max_attempts {
                        break;
                    }
                    tracing::debug!(url = %url_hint, status = s.as_u16(), "server error, backing off");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    continue;
                }
                s => {
                    let diagnostics = operation_outcome_diagnostics(response).await;
                    return Err(ClientError::Status {
                        status: s.as_u16(),
                        url: url_hint,
                        diagnostics,
                    });
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            url: url_hint,
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    /// GET a URL and parse the body as JSON.
    pub async fn get_json(&self, url: Url) -> Result<Value> {
        let response = self
            .execute(self.http.request(Method::GET, url).header("Accept", FHIR_JSON))
            .await?;
        parse_json_body(response).await
    }

    /// GET a URL, treating 404 as a soft miss.
    pub async fn get_json_optional(&self, url: Url) -> Result<Option<Value>> {
        match self.get_json(url).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a single resource; `None` when the server reports 404.
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let url = self.absolute(&format!("{resource_type}/{id}"))?;
        match self.get_json_optional(url.clone()).await? {
            Some(value) => Resource::new(value)
                .map(Some)
                .map_err(|e| ClientError::invalid_response(url.as_str(), e.to_string())),
            None => Ok(None),
        }
    }

    /// GET the server capability statement, trimmed to the REST section.
    pub async fn capabilities(&self) -> Result<Value> {
        let mut url = self.absolute("metadata")?;
        url.query_pairs_mut().append_pair("_elements", "rest");
        self.get_json(url).await
    }

    /// Run a FHIR search and return the first Bundle page.
    pub async fn search(&self, resource_type: &str, params: &[(String, String)]) -> Result<Value> {
        let mut url = self.absolute(resource_type)?;
        url.query_pairs_mut().extend_pairs(params);
        self.get_json(url).await
    }

    /// GET returning the raw response. Used by the bulk exporter for status
    /// polling, where 202 headers carry the protocol.
    pub async fn get_response(&self, url: Url, accept: &str) -> Result<Response> {
        self.execute(self.http.request(Method::GET, url).header("Accept", accept))
            .await
    }

    /// Bulk kickoff: POST a Parameters resource with
    /// `Prefer: respond-async`.
    pub async fn kickoff(&self, url: Url, parameters: &Value) -> Result<Response> {
        self.execute(
            self.http
                .request(Method::POST, url)
                .header("Accept", FHIR_JSON)
                .header("Content-Type", FHIR_JSON)
                .header("Prefer", "respond-async")
                .json(parameters),
        )
        .await
    }

    /// DELETE a URL, ignoring the response body.
    pub async fn delete(&self, url: Url) -> Result<()> {
        self.execute(self.http.request(Method::DELETE, url)).await?;
        Ok(())
    }

    /// Open a streaming GET for an NDJSON bulk file. The per-request timeout
    /// is raised for large downloads.
    pub async fn stream(&self, url: Url, timeout: Duration) -> Result<Response> {
        self.execute(
            self.http
                .request(Method::GET, url)
                .header("Accept", FHIR_NDJSON)
                .timeout(timeout),
        )
        .await
    }

    /// Fetch a binary attachment; returns the body and the response
    /// `Content-Type`. 404 is a soft miss.
    pub async fn fetch_binary(
        &self,
        url: Url,
        accept: &str,
    ) -> Result<Option<(Vec<u8>, Option<String>)>> {
        let request = self.http.request(Method::GET, url.clone()).header("Accept", accept);
        let response = match self.execute(request).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response.bytes().await.map_err(|e| ClientError::Transport {
            url: url.to_string(),
            source: e,
        })?;
        Ok(Some((body.to_vec(), content_type)))
    }
}

/// Parse `Retry-After` from a response: delta-seconds or HTTP-date.
pub fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get("Retry-After")?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = time::OffsetDateTime::parse(
        value,
        &time::format_description::well_known::Rfc2822,
    )
    .ok()?;
    let delta = when - time::OffsetDateTime::now_utc();
    Some(Duration::from_secs(delta.whole_seconds().max(0) as u64))
}

async fn parse_json_body(response: Response) -> Result<Value> {
    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .map_err(|e| ClientError::invalid_response(&url, e.to_string()))?;
    serde_json::from_str(&body)
        .map_err(|e| ClientError::invalid_response(&url, format!("invalid JSON: {e}")))
}

/// Pull human-readable diagnostics out of an OperationOutcome error body.
async fn operation_outcome_diagnostics(response: Response) -> Option<String> {
    let body = response.text().await.ok()?;
    let json: Value = serde_json::from_str(&body).ok()?;
    if json.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
        return (!body.is_empty()).then(|| truncate(&body, 500));
    }
    let issues = json.get("issue")?.as_array()?;
    let msgs: Vec<&str> = issues
        .iter()
        .filter_map(|i| i.get("diagnostics").and_then(Value::as_str))
        .collect();
    (!msgs.is_empty()).then(|| msgs.join("; "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

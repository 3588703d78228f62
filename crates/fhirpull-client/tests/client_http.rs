//! HTTP behavior tests against a mock FHIR server: retry, rate-limit
//! handling, auth refresh, and error surfacing.

use std::time::Duration;

use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use fhirpull_client::{
    BackendServicesConfig, ClientError, FhirClient, RetryPolicy, TokenManager,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

async fn client_for(server: &MockServer) -> FhirClient {
    FhirClient::builder(Url::parse(&format!("{}/fhir", server.uri())).unwrap())
        .retry(fast_retry())
        .build()
        .unwrap()
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "Patient", "id": "p1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let patient = client.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(patient.id(), "p1");
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(5)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.read("Patient", "p1").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::RetriesExhausted { attempts: 5, .. }
    ));
}

#[tokio::test]
async fn honors_retry_after_on_429() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "Patient", "id": "p1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(client.read("Patient", "p1").await.unwrap().is_some());
}

#[tokio::test]
async fn missing_resource_is_a_soft_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Observation/o99"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(client.read("Observation", "o99").await.unwrap().is_none());
}

#[tokio::test]
async fn gone_is_a_plain_client_error() {
    // 410 only means "export expired" on the bulk status URL; from any
    // other request it is an ordinary fatal 4xx
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let url = client.absolute("Observation/o1").unwrap();
    let err = client.get_json(url).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 410, .. }));
}

#[tokio::test]
async fn surfaces_operation_outcome_diagnostics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid", "diagnostics": "bad search parameter"}]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let url = client.absolute("Patient").unwrap();
    let err = client.get_json(url).await.unwrap_err();
    match err {
        ClientError::Status {
            status,
            diagnostics,
            ..
        } => {
            assert_eq!(status, 422);
            assert_eq!(diagnostics.as_deref(), Some("bad search parameter"));
        }
        other => panic!("expected Status error, got {other}"),
    }
}

fn write_test_key(dir: &std::path::Path) -> std::path::PathBuf {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    let path = dir.join("key.pem");
    std::fs::write(&path, pem.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn backend_services_auth_and_reauth_on_401() {
    let server = MockServer::start().await;

    // token endpoint issues sequential tokens
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(move |request: &Request| {
            let body = String::from_utf8_lossy(&request.body);
            assert!(body.contains("grant_type=client_credentials"));
            assert!(body.contains("client_assertion="));
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "token_type": "bearer",
                "expires_in": 300
            }))
        })
        .expect(2)
        .mount(&server)
        .await;

    // first resource call is rejected, second (after re-auth) succeeds
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "Patient", "id": "p1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let key_path = write_test_key(dir.path());
    let manager = TokenManager::from_key_file(
        reqwest::Client::new(),
        BackendServicesConfig {
            client_id: "my-client".into(),
            scope: "system/*.read".into(),
            token_endpoint: Url::parse(&format!("{}/token", server.uri())).unwrap(),
        },
        &key_path,
    )
    .unwrap();

    let client = FhirClient::builder(Url::parse(&format!("{}/fhir", server.uri())).unwrap())
        .retry(fast_retry())
        .auth(manager)
        .build()
        .unwrap();

    let patient = client.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(patient.id(), "p1");
}

#[tokio::test]
async fn unauthenticated_when_no_key_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(move |request: &Request| {
            assert!(request.headers.get("Authorization").is_none());
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resourceType": "CapabilityStatement", "rest": []
            }))
        })
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let cap = client.capabilities().await.unwrap();
    assert_eq!(cap["resourceType"], "CapabilityStatement");
}

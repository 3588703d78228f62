//! Bundle pagination.
//!
//! FHIR searches return `Bundle` pages chained through `link[rel=next]`.
//! [`SearchPages`] walks that chain lazily; the current next-link doubles as
//! a resume cursor, so an interrupted traversal can be restarted without
//! refetching earlier pages.

use serde_json::Value;
use url::Url;

use fhirpull_core::Resource;

use crate::client::FhirClient;
use crate::error::{ClientError, Result};

/// Lazy sequence of search result pages.
pub struct SearchPages {
    client: FhirClient,
    next: Option<Url>,
}

impl SearchPages {
    /// Start a traversal at the given search URL.
    pub fn new(client: FhirClient, first: Url) -> Self {
        Self {
            client,
            next: Some(first),
        }
    }

    /// Resume a traversal from a saved cursor, or finish immediately when
    /// the cursor is exhausted.
    pub fn resume(client: FhirClient, cursor: Option<Url>) -> Self {
        Self {
            client,
            next: cursor,
        }
    }

    /// The URL the next call to [`next_page`] will fetch.
    ///
    /// [`next_page`]: SearchPages::next_page
    pub fn cursor(&self) -> Option<&Url> {
        self.next.as_ref()
    }

    /// Fetch the next page, or `None` when the chain is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Value>> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        let bundle = self.client.get_json(url.clone()).await?;
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(ClientError::invalid_response(
                url.as_str(),
                "search did not return a Bundle",
            ));
        }
        self.next = match bundle_next_link(&bundle) {
            Some(link) => Some(Url::parse(link)?),
            None => None,
        };
        Ok(Some(bundle))
    }
}

/// The `link[rel=next]` URL of a Bundle, if present.
pub fn bundle_next_link(bundle: &Value) -> Option<&str> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|l| l.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|l| l.get("url"))
        .and_then(Value::as_str)
}

/// Extract the entry resources of a Bundle page.
///
/// Entries without a parseable resource (no `resourceType`/`id`) are
/// dropped; search Bundles also carry OperationOutcome entries with
/// `search.mode = outcome`, which are skipped here and surfaced by the
/// caller's logging instead.
pub fn bundle_entries(bundle: &Value) -> Vec<Resource> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| {
                    e.get("search")
                        .and_then(|s| s.get("mode"))
                        .and_then(Value::as_str)
                        != Some("outcome")
                })
                .filter_map(|e| e.get("resource"))
                .filter_map(|r| Resource::new(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(entries: Value, next: Option<&str>) -> Value {
        let mut links = vec![json!({"relation": "self", "url": "http://srv/fhir/Patient"})];
        if let Some(next) = next {
            links.push(json!({"relation": "next", "url": next}));
        }
        json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": links,
            "entry": entries,
        })
    }

    #[test]
    fn test_next_link_extraction() {
        let b = bundle(json!([]), Some("http://srv/fhir?page=2"));
        assert_eq!(bundle_next_link(&b), Some("http://srv/fhir?page=2"));

        let b = bundle(json!([]), None);
        assert_eq!(bundle_next_link(&b), None);
    }

    #[test]
    fn test_entry_extraction() {
        let b = bundle(
            json!([
                {"resource": {"resourceType": "Patient", "id": "p1"}},
                {"resource": {"resourceType": "Patient", "id": "p2"}},
            ]),
            None,
        );
        let entries = bundle_entries(&b);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id(), "p1");
    }

    #[test]
    fn test_entry_extraction_skips_outcomes() {
        let b = bundle(
            json!([
                {"resource": {"resourceType": "Patient", "id": "p1"}},
                {
                    "resource": {"resourceType": "OperationOutcome", "issue": []},
                    "search": {"mode": "outcome"}
                },
            ]),
            None,
        );
        let entries = bundle_entries(&b);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_entry_extraction_empty_bundle() {
        let b = json!({"resourceType": "Bundle", "type": "searchset"});
        assert!(bundle_entries(&b).is_empty());
    }

    #[tokio::test]
    async fn test_page_walk() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let page2 = format!("{}/fhir/Patient?page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/fhir/Patient"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bundle(
                json!([{"resource": {"resourceType": "Patient", "id": "p2"}}]),
                None,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fhir/Patient"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bundle(
                json!([{"resource": {"resourceType": "Patient", "id": "p1"}}]),
                Some(&page2),
            )))
            .mount(&server)
            .await;

        let client = FhirClient::builder(Url::parse(&format!("{}/fhir", server.uri())).unwrap())
            .build()
            .unwrap();
        let first = client.absolute("Patient").unwrap();
        let mut pages = SearchPages::new(client, first);

        let p1 = pages.next_page().await.unwrap().unwrap();
        assert_eq!(bundle_entries(&p1)[0].id(), "p1");
        assert!(pages.cursor().is_some());

        let p2 = pages.next_page().await.unwrap().unwrap();
        assert_eq!(bundle_entries(&p2)[0].id(), "p2");

        assert!(pages.next_page().await.unwrap().is_none());
    }
}

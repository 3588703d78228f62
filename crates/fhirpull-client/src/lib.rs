//! FHIR REST client for fhirpull.
//!
//! Wraps `reqwest` with the transport behavior every acquisition path needs:
//! SMART backend-services authentication, bounded retries with exponential
//! backoff and jitter, `Retry-After` handling, OperationOutcome diagnostics
//! surfacing, and Bundle pagination.

pub mod auth;
pub mod client;
pub mod error;
pub mod paging;

pub use auth::{BackendServicesConfig, TokenManager, discover_token_endpoint};
pub use client::{FhirClient, FhirClientBuilder, RetryPolicy};
pub use error::{ClientError, Result};
pub use paging::{SearchPages, bundle_entries, bundle_next_link};

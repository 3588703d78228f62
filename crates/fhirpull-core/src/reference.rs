//! FHIR reference parsing.
//!
//! References can appear in several formats:
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#contained-id` (cannot be fetched)
//! - URN: `urn:uuid:xxx` or `urn:oid:xxx` (cannot be fetched)
//!
//! The hydrator only follows references it can turn into a `(type, id)` pair
//! on the export server; everything else is skipped with a log entry.

use std::fmt;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// A reference that cannot be fetched from the export server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A URN reference (`urn:uuid:xxx` or `urn:oid:xxx`)
    Urn(String),
    /// A reference into a different server
    External(String),
    /// A malformed or invalid reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a FHIR reference string into its components.
///
/// Absolute URLs are resolved against `base_url` when provided; URLs under a
/// different base are reported as [`UnresolvableReference::External`].
/// Versioned references (`Type/id/_history/v`) resolve to their unversioned
/// identity.
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "empty reference".to_string(),
        ));
    }

    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }

    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let path = if reference.contains("://") {
        match base_url {
            Some(base) => {
                let normalized_base = base.trim_end_matches('/');
                if let Some(suffix) = reference.strip_prefix(normalized_base) {
                    suffix.trim_start_matches('/')
                } else {
                    return Err(UnresolvableReference::External(reference.to_string()));
                }
            }
            None => {
                return Err(UnresolvableReference::External(reference.to_string()));
            }
        }
    } else {
        reference
    };

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 2 {
        return Err(UnresolvableReference::Invalid(format!(
            "reference must contain at least Type/id: {reference}"
        )));
    }

    let resource_type = parts[0];
    let id = parts[1];

    if !resource_type
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        )));
    }

    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "resource id cannot be empty".to_string(),
        ));
    }

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::instant::FhirInstant;

/// Identity of a FHIR resource: the `(resourceType, id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A FHIR resource kept as raw JSON behind typed accessors.
///
/// fhirpull never remodels server payloads into typed structs; resources are
/// passed through byte-faithfully except where hydration inlines attachment
/// data. The envelope only guarantees the presence of `resourceType` and
/// `id`, which together form the resource identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Value);

impl Resource {
    /// Wrap a JSON value, validating the identity fields.
    pub fn new(value: Value) -> Result<Self> {
        let rt = value
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingField("resourceType"))?;
        if !rt.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            return Err(CoreError::invalid_resource_type(rt));
        }
        if value.get("id").and_then(Value::as_str).is_none() {
            return Err(CoreError::MissingField("id"));
        }
        Ok(Self(value))
    }

    /// Wrap a JSON value without identity validation.
    ///
    /// Used for server payloads that are structurally resources but may lack
    /// an `id`, such as OperationOutcome diagnostics.
    pub fn new_unchecked(value: Value) -> Self {
        Self(value)
    }

    pub fn resource_type(&self) -> &str {
        self.0
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type(), self.id())
    }

    /// `meta.lastUpdated`, when present and parseable.
    pub fn last_updated(&self) -> Option<FhirInstant> {
        self.0
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
            .and_then(|s| FhirInstant::from_str(s).ok())
    }

    /// Append a coding to `meta.tag`, creating the path as needed.
    pub fn add_meta_tag(&mut self, system: &str, code: &str) {
        let Some(obj) = self.0.as_object_mut() else {
            return;
        };
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            let tags = meta.entry("tag").or_insert_with(|| Value::Array(Vec::new()));
            if let Some(tags) = tags.as_array_mut() {
                let tag = serde_json::json!({"system": system, "code": code});
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
    }

    /// Whether `meta.tag` contains the given coding.
    pub fn has_meta_tag(&self, system: &str, code: &str) -> bool {
        self.0
            .get("meta")
            .and_then(|m| m.get("tag"))
            .and_then(Value::as_array)
            .is_some_and(|tags| {
                tags.iter().any(|t| {
                    t.get("system").and_then(Value::as_str) == Some(system)
                        && t.get("code").and_then(Value::as_str) == Some(code)
                })
            })
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_identity() {
        let r = Resource::new(json!({"resourceType": "Patient", "id": "p1"})).unwrap();
        assert_eq!(r.resource_type(), "Patient");
        assert_eq!(r.id(), "p1");
        assert_eq!(r.key(), ResourceKey::new("Patient", "p1"));
        assert_eq!(r.key().to_string(), "Patient/p1");
    }

    #[test]
    fn test_resource_missing_fields() {
        assert!(matches!(
            Resource::new(json!({"id": "p1"})),
            Err(CoreError::MissingField("resourceType"))
        ));
        assert!(matches!(
            Resource::new(json!({"resourceType": "Patient"})),
            Err(CoreError::MissingField("id"))
        ));
    }

    #[test]
    fn test_resource_invalid_type() {
        let r = Resource::new(json!({"resourceType": "patient", "id": "p1"}));
        assert!(matches!(r, Err(CoreError::InvalidResourceType(_))));
    }

    #[test]
    fn test_last_updated() {
        let r = Resource::new(json!({
            "resourceType": "Observation",
            "id": "o1",
            "meta": {"lastUpdated": "2023-05-15T14:30:00Z"}
        }))
        .unwrap();
        assert_eq!(
            r.last_updated().unwrap().to_string(),
            "2023-05-15T14:30:00Z"
        );

        let r = Resource::new(json!({"resourceType": "Observation", "id": "o2"})).unwrap();
        assert!(r.last_updated().is_none());
    }

    #[test]
    fn test_meta_tag_roundtrip() {
        let mut r = Resource::new(json!({"resourceType": "DocumentReference", "id": "d1"})).unwrap();
        assert!(!r.has_meta_tag("urn:example", "hydrated"));
        r.add_meta_tag("urn:example", "hydrated");
        assert!(r.has_meta_tag("urn:example", "hydrated"));

        // adding twice keeps a single tag
        r.add_meta_tag("urn:example", "hydrated");
        let tags = r.as_value()["meta"]["tag"].as_array().unwrap();
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn test_serde_transparent() {
        let value = json!({"resourceType": "Patient", "id": "p1", "active": true});
        let r = Resource::new(value.clone()).unwrap();
        let serialized = serde_json::to_value(&r).unwrap();
        assert_eq!(serialized, value);
    }
}

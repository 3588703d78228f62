//! Capability statement probing.
//!
//! The export driver inspects the server's CapabilityStatement to pick an
//! acquisition mode (`$export` advertised → bulk) and a since mode
//! (`_lastUpdated` searchable → `updated`, otherwise `created`).

use serde_json::Value;

/// Whether the server advertises a system- or group-level `$export`
/// operation.
pub fn supports_bulk_export(capabilities: &Value) -> bool {
    let Some(rest) = capabilities.get("rest").and_then(Value::as_array) else {
        return false;
    };
    rest.iter().any(|r| {
        let system_level = r
            .get("operation")
            .and_then(Value::as_array)
            .is_some_and(|ops| ops.iter().any(is_export_operation));
        let group_level = r
            .get("resource")
            .and_then(Value::as_array)
            .is_some_and(|resources| {
                resources.iter().any(|res| {
                    res.get("operation")
                        .and_then(Value::as_array)
                        .is_some_and(|ops| ops.iter().any(is_export_operation))
                })
            });
        system_level || group_level
    })
}

fn is_export_operation(op: &Value) -> bool {
    op.get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name == "export" || name == "group-export" || name == "patient-export")
}

/// Whether any resource advertises `_lastUpdated` as a search parameter.
pub fn supports_last_updated(capabilities: &Value) -> bool {
    let Some(rest) = capabilities.get("rest").and_then(Value::as_array) else {
        return false;
    };
    rest.iter().any(|r| {
        r.get("resource")
            .and_then(Value::as_array)
            .is_some_and(|resources| {
                resources.iter().any(|res| {
                    res.get("searchParam")
                        .and_then(Value::as_array)
                        .is_some_and(|params| {
                            params.iter().any(|p| {
                                p.get("name").and_then(Value::as_str) == Some("_lastUpdated")
                            })
                        })
                })
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_level_export() {
        let cap = json!({
            "resourceType": "CapabilityStatement",
            "rest": [{
                "mode": "server",
                "operation": [{"name": "export", "definition": "http://hl7.org/fhir/uv/bulkdata/OperationDefinition/export"}]
            }]
        });
        assert!(supports_bulk_export(&cap));
    }

    #[test]
    fn test_group_level_export() {
        let cap = json!({
            "rest": [{
                "resource": [{
                    "type": "Group",
                    "operation": [{"name": "group-export", "definition": "..."}]
                }]
            }]
        });
        assert!(supports_bulk_export(&cap));
    }

    #[test]
    fn test_no_export() {
        let cap = json!({
            "rest": [{"resource": [{"type": "Patient"}]}]
        });
        assert!(!supports_bulk_export(&cap));
        assert!(!supports_bulk_export(&json!({})));
    }

    #[test]
    fn test_last_updated_detection() {
        let cap = json!({
            "rest": [{
                "resource": [{
                    "type": "Patient",
                    "searchParam": [
                        {"name": "identifier", "type": "token"},
                        {"name": "_lastUpdated", "type": "date"}
                    ]
                }]
            }]
        });
        assert!(supports_last_updated(&cap));

        let cap = json!({
            "rest": [{
                "resource": [{"type": "Patient", "searchParam": [{"name": "identifier"}]}]
            }]
        });
        assert!(!supports_last_updated(&cap));
    }
}

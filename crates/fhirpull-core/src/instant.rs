use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// An RFC 3339 instant as used by FHIR `instant` and `dateTime` fields.
///
/// Ordering follows the underlying point in time, independent of the
/// offset the server happened to render it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirInstant(pub OffsetDateTime);

impl FhirInstant {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn timestamp(&self) -> i64 {
        self.0.unix_timestamp()
    }

    /// Render in canonical UTC `Z` form, regardless of the original offset.
    pub fn to_utc_string(&self) -> String {
        let utc = self.0.to_offset(time::UtcOffset::UTC);
        utc.format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
    }
}

impl fmt::Display for FhirInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(&Rfc3339).map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for FhirInstant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        // FHIR allows date-precision values in dateTime fields; pad them out
        // so a bare "2020-01-01" still parses as the start of that day UTC.
        let padded;
        let candidate = match s.len() {
            4 => {
                padded = format!("{s}-01-01T00:00:00Z");
                padded.as_str()
            }
            7 => {
                padded = format!("{s}-01T00:00:00Z");
                padded.as_str()
            }
            10 => {
                padded = format!("{s}T00:00:00Z");
                padded.as_str()
            }
            _ => s,
        };
        let datetime = OffsetDateTime::parse(candidate, &Rfc3339)
            .map_err(|e| CoreError::invalid_instant(format!("Failed to parse instant '{s}': {e}")))?;
        Ok(FhirInstant(datetime))
    }
}

impl Serialize for FhirInstant {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self.0.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for FhirInstant {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FhirInstant::from_str(&s).map_err(serde::de::Error::custom)
    }
}

pub fn now_utc() -> FhirInstant {
    FhirInstant(OffsetDateTime::now_utc())
}

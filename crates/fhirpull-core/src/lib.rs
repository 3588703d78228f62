pub mod error;
pub mod instant;
pub mod reference;
pub mod resource;

pub use error::{CoreError, Result};
pub use instant::{FhirInstant, now_utc};
pub use reference::{FhirReference, UnresolvableReference, parse_reference};
pub use resource::{Resource, ResourceKey};

//! Acquisition and hydration engines for fhirpull.
//!
//! Two acquisition paths fill an export workspace with NDJSON: the
//! [`bulk`] state machine drives the server's Bulk Data `$export`
//! operation, and the [`crawl`] engine fans client-side searches out over
//! a patient cohort. The [`hydrate`] stage then fills in attachment
//! bodies and referenced resources the acquisition left out. [`export`]
//! is the driver that sequences a whole run; [`scheduler`] owns the
//! concurrency budgets and the cancellation signal all of them observe.

pub mod bulk;
pub mod capability;
pub mod cohort;
pub mod crawl;
pub mod error;
pub mod export;
pub mod hydrate;
pub mod scheduler;

pub use bulk::{BulkExporter, BulkManifest, BulkOptions, BulkState};
pub use cohort::{CohortResolver, CohortSource, ResolvedCohort};
pub use crawl::{CrawlOptions, CrawlReport, Crawler};
pub use error::{EngineError, Result};
pub use export::{ExportOutcome, ExportRequest, ModeArg, SinceArg, run_export, run_hydrate};
pub use hydrate::{HydrateOptions, HydrationTask, Hydrator};
pub use scheduler::{Budget, Budgets, Scheduler};

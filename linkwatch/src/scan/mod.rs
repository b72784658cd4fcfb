//! Vendor scan workflows.
//!
//! [`ScanOrchestrator`] runs diagnostics such as eye scans through a
//! device's interactive shell; [`register_metrics`] turns exec-based
//! [`MetricTemplate`]s into pool workers for the system under test.

mod mapping;
mod metrics;
mod orchestrator;
mod toggle;

pub use mapping::{MappingCache, PortMapping, render};
pub use metrics::{MetricTemplate, register_metrics};
pub use orchestrator::{LogSettings, ScanOrchestrator, ScanOrchestratorBuilder, ScanSpec};
pub use toggle::{TogglePolicy, ToggleTracker};

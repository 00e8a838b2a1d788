use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

mod error;

pub use error::*;

/// The default interval for requeuing a reconciled node.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "node-lifecycle-operator";

use crate::util::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

mod preactivities;
mod replacement;
mod waittime;

pub use preactivities::PreActivitiesPreProcessor;
pub use replacement::NodeReplacementPreProcessor;
pub use waittime::WaitTimePreProcessor;

/// Why a pre-processor considers a candidate not ready. Variant order is
/// escalation order: later variants dominate when several activities block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotDoneReason {
    Processing,
    Timeout,
    Failure,
    NotCandidate,
}

impl NotDoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotDoneReason::Processing => "processing",
            NotDoneReason::Timeout => "timeout",
            NotDoneReason::Failure => "failure",
            NotDoneReason::NotCandidate => "not-candidate",
        }
    }
}

impl std::fmt::Display for NotDoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreProcessResult {
    Done,
    NotDone(NotDoneReason),
}

/// One gate a candidate must clear before it may be drained. The runner
/// treats `NotDone` as a soft gate (loop again) and errors as transient.
#[async_trait]
pub trait PreProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the candidate may proceed to drain.
    async fn is_done(&self, node: &Node) -> Result<PreProcessResult, Error>;

    /// Clears any state this processor left behind so the next drain attempt
    /// starts fresh.
    async fn reset(&self, node: &Node) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_escalate_in_variant_order() {
        assert!(NotDoneReason::Failure > NotDoneReason::Timeout);
        assert!(NotDoneReason::Timeout > NotDoneReason::Processing);
    }
}

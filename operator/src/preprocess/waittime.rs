use super::{NotDoneReason, PreProcessResult, PreProcessor};
use crate::kubernetes::taints::candidate_since;
use crate::util::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::jiff::Timestamp;
use std::time::Duration;

fn waited_enough(since: Timestamp, now: Timestamp, wait: Duration) -> bool {
    now.duration_since(since).as_secs() >= wait.as_secs() as i64
}

/// Holds every candidate for a fixed settling period after it was tainted.
pub struct WaitTimePreProcessor {
    wait: Duration,
}

impl WaitTimePreProcessor {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }
}

#[async_trait]
impl PreProcessor for WaitTimePreProcessor {
    fn name(&self) -> &'static str {
        "wait-time"
    }

    async fn is_done(&self, node: &Node) -> Result<PreProcessResult, Error> {
        let Some(since) = candidate_since(node) else {
            return Ok(PreProcessResult::NotDone(NotDoneReason::NotCandidate));
        };
        if waited_enough(since, Timestamp::now(), self.wait) {
            Ok(PreProcessResult::Done)
        } else {
            Ok(PreProcessResult::NotDone(NotDoneReason::Processing))
        }
    }

    async fn reset(&self, _node: &Node) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_wait_is_inclusive_at_the_boundary() {
        let since = Timestamp::UNIX_EPOCH;
        let wait = Duration::from_secs(300);
        assert!(!waited_enough(
            since,
            Timestamp::from_second(299).unwrap(),
            wait
        ));
        assert!(waited_enough(
            since,
            Timestamp::from_second(300).unwrap(),
            wait
        ));
    }

    #[test]
    fn zero_wait_passes_immediately() {
        let since = Timestamp::from_second(1000).unwrap();
        assert!(waited_enough(since, since, Duration::ZERO));
    }
}

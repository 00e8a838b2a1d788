use crate::kubernetes::{RETRY_AT_ANNOTATION, RETRY_COUNT_ANNOTATION, RETRY_REASON_ANNOTATION};
use crate::util::{Error, patch::patch_node};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use std::time::Duration;

/// Per-node drain back-off, stored on the node itself so it survives
/// controller restarts. The authoritative store arbitrates concurrent
/// writers.
#[derive(Clone, Debug)]
pub struct RetryWall {
    backoff_base: Duration,
    backoff_ceiling: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryRecord {
    pub attempt: u32,
    pub last_failure: DateTime<Utc>,
    pub reason: String,
}

/// Parses the retry annotations. A node with missing or mangled values is
/// treated as never having failed.
pub(crate) fn read_record(node: &Node) -> Option<RetryRecord> {
    let annotations = node.metadata.annotations.as_ref()?;
    let attempt = annotations.get(RETRY_COUNT_ANNOTATION)?.parse().ok()?;
    let last_failure = DateTime::parse_from_rfc3339(annotations.get(RETRY_AT_ANNOTATION)?)
        .ok()?
        .with_timezone(&Utc);
    let reason = annotations
        .get(RETRY_REASON_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    Some(RetryRecord {
        attempt,
        last_failure,
        reason,
    })
}

pub(crate) fn write_record(node: &mut Node, record: &RetryRecord) {
    let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(
        RETRY_COUNT_ANNOTATION.to_string(),
        record.attempt.to_string(),
    );
    annotations.insert(
        RETRY_AT_ANNOTATION.to_string(),
        record
            .last_failure
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    annotations.insert(RETRY_REASON_ANNOTATION.to_string(), record.reason.clone());
}

pub(crate) fn clear_record(node: &mut Node) {
    if let Some(annotations) = node.metadata.annotations.as_mut() {
        annotations.remove(RETRY_COUNT_ANNOTATION);
        annotations.remove(RETRY_AT_ANNOTATION);
        annotations.remove(RETRY_REASON_ANNOTATION);
    }
}

impl RetryWall {
    pub fn new(backoff_base: Duration, backoff_ceiling: Duration) -> Self {
        Self {
            backoff_base,
            backoff_ceiling,
        }
    }

    /// Exponential in the attempt count, capped at the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_ceiling)
    }

    /// When the node may next be drained. Nodes without a failure record may
    /// be drained immediately.
    pub fn next_allowed_attempt(&self, node: &Node) -> Result<DateTime<Utc>, Error> {
        let Some(record) = read_record(node) else {
            return Ok(DateTime::<Utc>::UNIX_EPOCH);
        };
        let backoff = chrono::Duration::from_std(self.backoff(record.attempt))?;
        Ok(record.last_failure + backoff)
    }

    /// Bumps the attempt counter and records the failure on the node.
    pub async fn set_new_retry_wall_timestamp(
        &self,
        client: Client,
        node: &Node,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Node, Error> {
        let attempt = read_record(node).map(|r| r.attempt).unwrap_or(0) + 1;
        let record = RetryRecord {
            attempt,
            last_failure: now,
            reason: reason.to_string(),
        };
        patch_node(client, node, |n| write_record(n, &record)).await
    }

    /// Clears the failure record after a successful drain.
    pub async fn reset(&self, client: Client, node: &Node) -> Result<Node, Error> {
        patch_node(client, node, clear_record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall() -> RetryWall {
        RetryWall::new(Duration::from_secs(60), Duration::from_secs(3600))
    }

    #[test]
    fn backoff_doubles_until_the_ceiling() {
        let wall = wall();
        assert_eq!(wall.backoff(0), Duration::ZERO);
        assert_eq!(wall.backoff(1), Duration::from_secs(60));
        assert_eq!(wall.backoff(2), Duration::from_secs(120));
        assert_eq!(wall.backoff(4), Duration::from_secs(480));
        assert_eq!(wall.backoff(10), Duration::from_secs(3600));
        assert_eq!(wall.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn record_round_trips_through_annotations() {
        let record = RetryRecord {
            attempt: 3,
            last_failure: DateTime::parse_from_rfc3339("2026-02-11T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            reason: "drain failed: eviction stalled".to_string(),
        };
        let mut node = Node::default();
        write_record(&mut node, &record);
        assert_eq!(read_record(&node), Some(record));
        clear_record(&mut node);
        assert_eq!(read_record(&node), None);
    }

    #[test]
    fn unfailed_node_is_allowed_immediately() {
        let node = Node::default();
        assert_eq!(
            wall().next_allowed_attempt(&node).unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[test]
    fn next_attempt_trails_the_failure_by_the_backoff() {
        let mut node = Node::default();
        let failure = DateTime::parse_from_rfc3339("2026-02-11T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        write_record(
            &mut node,
            &RetryRecord {
                attempt: 2,
                last_failure: failure,
                reason: "x".to_string(),
            },
        );
        let next = wall().next_allowed_attempt(&node).unwrap();
        assert_eq!(next, failure + chrono::Duration::seconds(120));
    }

    #[test]
    fn mangled_annotations_read_as_no_record() {
        let mut node = Node::default();
        let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(RETRY_COUNT_ANNOTATION.to_string(), "three".to_string());
        annotations.insert(RETRY_AT_ANNOTATION.to_string(), "yesterday".to_string());
        assert_eq!(read_record(&node), None);
    }
}

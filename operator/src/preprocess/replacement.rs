use super::{NotDoneReason, PreProcessResult, PreProcessor};
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::taints::candidate_since;
use crate::kubernetes::{REPLACE_ANNOTATION, REPLACEMENT_LABEL};
use crate::util::{Error, patch::patch_node};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::jiff::Timestamp;
use owo_colors::OwoColorize;
use std::time::Duration;

pub const REPLACEMENT_REQUESTED: &str = "requested";
pub const REPLACEMENT_DONE: &str = "done";
pub const REPLACEMENT_FAILED: &str = "failed";

/// What the replacement label currently tells us. The value set is open:
/// anything unrecognized reads as still in progress so newer replacement
/// actors can introduce intermediate states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplacementStep {
    Request,
    InProgress,
    Done,
    Failed,
}

fn replacement_step(label: Option<&str>) -> ReplacementStep {
    match label {
        None => ReplacementStep::Request,
        Some(REPLACEMENT_DONE) => ReplacementStep::Done,
        Some(REPLACEMENT_FAILED) => ReplacementStep::Failed,
        Some(_) => ReplacementStep::InProgress,
    }
}

/// Opt-in annotation wins; otherwise the controller-wide default applies,
/// which an explicit `false` always overrides.
fn eligible_for_replacement(node: &Node, replace_by_default: bool) -> bool {
    match node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REPLACE_ANNOTATION))
        .map(String::as_str)
    {
        Some("true") => true,
        Some("false") => false,
        _ => replace_by_default,
    }
}

fn timed_out(since: Timestamp, now: Timestamp, timeout: Duration) -> bool {
    now.duration_since(since).as_secs() > timeout.as_secs() as i64
}

/// Requests an external node replacement before the drain and waits for the
/// replacement actor to report back through the label state machine.
pub struct NodeReplacementPreProcessor {
    k8s: ThrottledClient,
    replace_by_default: bool,
    timeout: Duration,
}

impl NodeReplacementPreProcessor {
    pub fn new(k8s: ThrottledClient, replace_by_default: bool, timeout: Duration) -> Self {
        Self {
            k8s,
            replace_by_default,
            timeout,
        }
    }

    fn label<'a>(&self, node: &'a Node) -> Option<&'a str> {
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(REPLACEMENT_LABEL))
            .map(String::as_str)
    }
}

#[async_trait]
impl PreProcessor for NodeReplacementPreProcessor {
    fn name(&self) -> &'static str {
        "node-replacement"
    }

    async fn is_done(&self, node: &Node) -> Result<PreProcessResult, Error> {
        if !eligible_for_replacement(node, self.replace_by_default) {
            return Ok(PreProcessResult::Done);
        }
        let step = replacement_step(self.label(node));
        if step == ReplacementStep::Done {
            return Ok(PreProcessResult::Done);
        }
        if let Some(since) = candidate_since(node)
            && timed_out(since, Timestamp::now(), self.timeout)
        {
            return Ok(PreProcessResult::NotDone(NotDoneReason::Timeout));
        }
        match step {
            ReplacementStep::Failed => Ok(PreProcessResult::NotDone(NotDoneReason::Failure)),
            ReplacementStep::InProgress => Ok(PreProcessResult::NotDone(NotDoneReason::Processing)),
            ReplacementStep::Request => {
                println!(
                    "{}",
                    format!(
                        "🔁 requesting replacement for node '{}'",
                        node.metadata.name.as_deref().unwrap_or("?")
                    )
                    .cyan()
                );
                patch_node(self.k8s.acquire().await, node, |n| {
                    n.metadata
                        .labels
                        .get_or_insert_with(Default::default)
                        .insert(
                            REPLACEMENT_LABEL.to_string(),
                            REPLACEMENT_REQUESTED.to_string(),
                        );
                })
                .await?;
                Ok(PreProcessResult::NotDone(NotDoneReason::Processing))
            }
            ReplacementStep::Done => unreachable!("handled above"),
        }
    }

    async fn reset(&self, node: &Node) -> Result<(), Error> {
        patch_node(self.k8s.acquire().await, node, |n| {
            if let Some(labels) = n.metadata.labels.as_mut() {
                labels.remove(REPLACEMENT_LABEL);
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn annotated(value: Option<&str>) -> Node {
        let mut node = Node::default();
        if let Some(value) = value {
            node.metadata.annotations = Some(BTreeMap::from([(
                REPLACE_ANNOTATION.to_string(),
                value.to_string(),
            )]));
        }
        node
    }

    #[test]
    fn unknown_label_values_read_as_in_progress() {
        assert_eq!(
            replacement_step(Some("weird-value")),
            ReplacementStep::InProgress
        );
        assert_eq!(
            replacement_step(Some(REPLACEMENT_REQUESTED)),
            ReplacementStep::InProgress
        );
    }

    #[test]
    fn terminal_label_values_are_recognized() {
        assert_eq!(replacement_step(None), ReplacementStep::Request);
        assert_eq!(replacement_step(Some("done")), ReplacementStep::Done);
        assert_eq!(replacement_step(Some("failed")), ReplacementStep::Failed);
    }

    #[test]
    fn annotation_overrides_the_default_in_both_directions() {
        assert!(eligible_for_replacement(&annotated(Some("true")), false));
        assert!(!eligible_for_replacement(&annotated(Some("false")), true));
        assert!(eligible_for_replacement(&annotated(None), true));
        assert!(!eligible_for_replacement(&annotated(None), false));
        // Anything that is not exactly "true"/"false" falls back to the default.
        assert!(eligible_for_replacement(&annotated(Some("yes")), true));
        assert!(!eligible_for_replacement(&annotated(Some("yes")), false));
    }

    #[test]
    fn timeout_measures_from_the_candidate_clock() {
        let since = Timestamp::UNIX_EPOCH;
        let timeout = Duration::from_secs(3600);
        let just_under = Timestamp::from_second(3600).unwrap();
        let over = Timestamp::from_second(7200).unwrap();
        assert!(!timed_out(since, just_under, timeout));
        assert!(timed_out(since, over, timeout));
    }
}

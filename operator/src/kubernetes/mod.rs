use const_format::concatcp;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::sync::Arc;

pub mod client;
pub mod conditions;
pub mod events;
pub mod index;
pub mod taints;

/// Annotation/label domain of the node-lifecycle stack.
pub const DOMAIN: &str = "node-lifecycle.datadoghq.com";

/// Taint carried by nodes moving through the drain pipeline.
pub const DRAIN_TAINT_KEY: &str = "draino";

/// Label mirroring the node-replacement state machine. Written as
/// `requested` by this controller; the replacement actor reports back
/// `done` or `failed`.
pub const REPLACEMENT_LABEL: &str = concatcp!(DOMAIN, "/node-replacement");

/// Annotation opting a node in (`true`) or out (`false`) of pre-drain
/// replacement.
pub const REPLACE_ANNOTATION: &str = concatcp!(DOMAIN, "/replace");

/// Prefix of operator-declared pre-activity state annotations.
pub const PRE_ACTIVITY_PREFIX: &str = concatcp!(DOMAIN, "/pre-activity-");

/// Prefix of pre-activity timeout overrides; the suffix pairs the timeout
/// with the state annotation on the same object.
pub const PRE_ACTIVITY_TIMEOUT_PREFIX: &str = concatcp!(DOMAIN, "/timeout-pre-activity-");

/// Retry wall annotations, stored on the node so the back-off survives
/// controller restarts.
pub const RETRY_COUNT_ANNOTATION: &str = concatcp!(DOMAIN, "/drain-retry-failed-count");
pub const RETRY_AT_ANNOTATION: &str = concatcp!(DOMAIN, "/drain-retry-failed-at");
pub const RETRY_REASON_ANNOTATION: &str = concatcp!(DOMAIN, "/drain-retry-reason");

/// Predicate selecting the pods the controllers act on. Must be pure and
/// fast; it runs once per pod per reconcile.
pub type PodFilterFunc = Arc<dyn Fn(&Pod) -> bool + Send + Sync>;

/// Maps a node to the opaque key of the drain group it belongs to.
pub type GroupKeyFunc = Arc<dyn Fn(&Node) -> String + Send + Sync>;

/// Group key assigned to nodes that carry no grouping label.
pub const DEFAULT_GROUP_KEY: &str = "default";

/// Builds the default grouping function: the value of `label`, falling back
/// to [`DEFAULT_GROUP_KEY`] for unlabeled nodes.
pub fn group_key_from_label(label: String) -> GroupKeyFunc {
    Arc::new(move |node: &Node| {
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&label))
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP_KEY.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn group_key_falls_back_for_unlabeled_nodes() {
        let group = group_key_from_label("topology.kubernetes.io/zone".to_string());
        let node = Node::default();
        assert_eq!(group(&node), DEFAULT_GROUP_KEY);
    }

    #[test]
    fn group_key_reads_the_label_value() {
        let group = group_key_from_label("topology.kubernetes.io/zone".to_string());
        let node = Node {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([(
                    "topology.kubernetes.io/zone".to_string(),
                    "us-east-1a".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(group(&node), "us-east-1a");
    }
}

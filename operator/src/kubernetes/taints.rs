pub use super::DRAIN_TAINT_KEY;
use crate::util::{Error, patch::patch_node};
use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::Client;

/// Effect of the drain taint: candidates stop receiving new workloads.
pub const DRAIN_TAINT_EFFECT: &str = "NoSchedule";

/// Values of the drain taint, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainState {
    Candidate,
    Draining,
    Drained,
    ForceDrain,
}

impl DrainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainState::Candidate => "drain-candidate",
            DrainState::Draining => "draining",
            DrainState::Drained => "drained",
            DrainState::ForceDrain => "force-drain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drain-candidate" => Some(DrainState::Candidate),
            "draining" => Some(DrainState::Draining),
            "drained" => Some(DrainState::Drained),
            "force-drain" => Some(DrainState::ForceDrain),
            _ => None,
        }
    }
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the drain taint carried by the node, if any.
pub fn get_taint(node: &Node) -> Option<&Taint> {
    node.spec
        .as_ref()?
        .taints
        .as_ref()?
        .iter()
        .find(|t| t.key == DRAIN_TAINT_KEY)
}

/// The drain state encoded in the node's taint, if recognizable.
pub fn drain_state(node: &Node) -> Option<DrainState> {
    DrainState::parse(get_taint(node)?.value.as_deref()?)
}

/// The `time_added` of the drain taint; the reference clock for every
/// candidate timeout.
pub fn candidate_since(node: &Node) -> Option<Timestamp> {
    get_taint(node)?.time_added.as_ref().map(|t| t.0)
}

/// Whether the node is currently inside the drain pipeline.
pub fn is_drain_candidate(node: &Node) -> bool {
    matches!(
        drain_state(node),
        Some(DrainState::Candidate) | Some(DrainState::Draining)
    )
}

/// Replaces any existing drain taint with `state`. The node never carries
/// two entries for the drain key.
pub(crate) fn set_drain_taint(node: &mut Node, state: DrainState, now: Timestamp) {
    let spec = node.spec.get_or_insert_with(Default::default);
    let taints = spec.taints.get_or_insert_with(Default::default);
    taints.retain(|t| t.key != DRAIN_TAINT_KEY);
    taints.push(Taint {
        key: DRAIN_TAINT_KEY.to_string(),
        value: Some(state.as_str().to_string()),
        effect: DRAIN_TAINT_EFFECT.to_string(),
        time_added: Some(Time(now)),
    });
}

/// Removes the drain taint regardless of its current value.
pub(crate) fn remove_drain_taint(node: &mut Node) {
    if let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) {
        taints.retain(|t| t.key != DRAIN_TAINT_KEY);
    }
}

/// Adds or updates the drain taint on the node. A node already carrying the
/// same value keeps its original `time_added` and no write is issued.
pub async fn taint_node(
    client: Client,
    node: &Node,
    state: DrainState,
    now: Timestamp,
) -> Result<Node, Error> {
    if drain_state(node) == Some(state) {
        return Ok(node.clone());
    }
    patch_node(client, node, |n| set_drain_taint(n, state, now)).await
}

/// Removes the drain taint from the node.
pub async fn untaint_node(client: Client, node: &Node) -> Result<Node, Error> {
    patch_node(client, node, remove_drain_taint).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

    fn tainted(value: &str) -> Node {
        let mut node = Node::default();
        node.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: DRAIN_TAINT_KEY.to_string(),
                value: Some(value.to_string()),
                effect: DRAIN_TAINT_EFFECT.to_string(),
                time_added: Some(Time(Timestamp::UNIX_EPOCH)),
            }]),
            ..Default::default()
        });
        node
    }

    #[test]
    fn state_round_trips_through_the_taint_value() {
        for state in [
            DrainState::Candidate,
            DrainState::Draining,
            DrainState::Drained,
            DrainState::ForceDrain,
        ] {
            assert_eq!(DrainState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DrainState::parse("cordoned"), None);
    }

    #[test]
    fn set_replaces_instead_of_duplicating() {
        let mut node = tainted("drain-candidate");
        set_drain_taint(&mut node, DrainState::Draining, Timestamp::UNIX_EPOCH);
        let taints = node.spec.as_ref().unwrap().taints.as_ref().unwrap();
        assert_eq!(
            taints.iter().filter(|t| t.key == DRAIN_TAINT_KEY).count(),
            1
        );
        assert_eq!(drain_state(&node), Some(DrainState::Draining));
    }

    #[test]
    fn unrelated_taints_survive_removal() {
        let mut node = tainted("draining");
        node.spec
            .as_mut()
            .unwrap()
            .taints
            .as_mut()
            .unwrap()
            .push(Taint {
                key: "node.kubernetes.io/unreachable".to_string(),
                value: None,
                effect: "NoExecute".to_string(),
                time_added: None,
            });
        remove_drain_taint(&mut node);
        let taints = node.spec.as_ref().unwrap().taints.as_ref().unwrap();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "node.kubernetes.io/unreachable");
        assert_eq!(drain_state(&node), None);
    }

    #[test]
    fn candidate_covers_draining_but_not_terminal_states() {
        assert!(is_drain_candidate(&tainted("drain-candidate")));
        assert!(is_drain_candidate(&tainted("draining")));
        assert!(!is_drain_candidate(&tainted("drained")));
        assert!(!is_drain_candidate(&tainted("force-drain")));
        assert!(!is_drain_candidate(&Node::default()));
    }

    #[test]
    fn untainted_node_has_no_candidate_clock() {
        assert_eq!(candidate_since(&Node::default()), None);
        assert_eq!(
            candidate_since(&tainted("drain-candidate")),
            Some(Timestamp::UNIX_EPOCH)
        );
    }
}

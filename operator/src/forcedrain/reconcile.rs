use crate::drain::Drainer;
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::taints::{DrainState, drain_state, taint_node};
use crate::util::Error;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::jiff::Timestamp;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use owo_colors::OwoColorize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Parallelism of the force-drain reconciler.
const FORCE_DRAIN_CONCURRENCY: u16 = 2;

/// A node condition regarded as unrecoverable. Only conditions flagged
/// `force_evict` make the node eligible for the forced path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnrecoverableCondition {
    pub condition_type: String,
    pub force_evict: bool,
}

impl FromStr for UnrecoverableCondition {
    type Err = Error;

    /// Accepts `TYPE` or `TYPE:force`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => Ok(Self {
                condition_type: s.to_string(),
                force_evict: false,
            }),
            Some((condition_type, "force")) => Ok(Self {
                condition_type: condition_type.to_string(),
                force_evict: true,
            }),
            Some((_, flag)) => Err(Error::UserInput(format!(
                "unknown unrecoverable-condition flag '{}'; expected 'force'",
                flag
            ))),
        }
    }
}

/// The configured unrecoverable conditions present on the node with status
/// `True`.
pub(crate) fn offending<'a>(
    node: &Node,
    configured: &'a [UnrecoverableCondition],
) -> Vec<&'a UnrecoverableCondition> {
    let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return Vec::new();
    };
    configured
        .iter()
        .filter(|c| {
            conditions
                .iter()
                .any(|nc| nc.type_ == c.condition_type && nc.status == "True")
        })
        .collect()
}

struct ContextData {
    k8s: ThrottledClient,
    drainer: Arc<dyn Drainer>,
    conditions: Vec<UnrecoverableCondition>,
    token: CancellationToken,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

/// Entrypoint for the force-drain controller. Reconciles on node creates and
/// updates; deletions surface as absent objects and are skipped through the
/// deletion-timestamp guard.
pub async fn run(
    k8s: ThrottledClient,
    drainer: Arc<dyn Drainer>,
    conditions: Vec<UnrecoverableCondition>,
    token: CancellationToken,
) {
    println!("{}", "⚙️ Starting force-drain controller...".green());
    let context = Arc::new(ContextData {
        k8s: k8s.clone(),
        drainer,
        conditions,
        token: token.clone(),
        #[cfg(feature = "metrics")]
        metrics: ControllerMetrics::new("force_drain"),
    });
    let nodes: Api<Node> = Api::all(k8s.raw());
    let controller = Controller::new(nodes, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(FORCE_DRAIN_CONCURRENCY))
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {});
    tokio::select! {
        _ = token.cancelled() => {}
        _ = controller => {}
    }
    println!("{}", "🛑 Force-drain controller stopped".red());
}

/// Short-circuits the whole pipeline for nodes carrying an unrecoverable
/// condition flagged for forced eviction.
async fn reconcile(node: Arc<Node>, context: Arc<ContextData>) -> Result<Action, Error> {
    if node.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&node.name_any()])
        .inc();

    let hits = offending(&node, &context.conditions);
    if hits.is_empty() {
        return Ok(Action::await_change());
    }
    if !hits.iter().any(|c| c.force_evict) {
        println!(
            "{}",
            format!(
                "⚠️ node '{}' is unrecoverable ({}) but not force-eligible",
                node.name_any(),
                hits.iter()
                    .map(|c| c.condition_type.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
            .yellow()
        );
        return Ok(Action::await_change());
    }
    // One forced pass per node; the taint is terminal for this path.
    if drain_state(&node) == Some(DrainState::ForceDrain) {
        return Ok(Action::await_change());
    }

    let node = taint_node(
        context.k8s.acquire().await,
        &node,
        DrainState::ForceDrain,
        Timestamp::now(),
    )
    .await?;
    context.drainer.force_drain(&node, &context.token).await?;
    println!(
        "{}",
        format!("🧨 node '{}' force-drained", node.name_any()).red()
    );
    Ok(Action::await_change())
}

/// Errors propagate here so the manager requeues the node.
fn on_error(node: Arc<Node>, error: &Error, context: Arc<ContextData>) -> Action {
    #[cfg(feature = "metrics")]
    context
        .metrics
        .error_counter
        .with_label_values(&[&node.name_any()])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = &context;
    eprintln!(
        "{}",
        format!("Force-drain error on node '{}': {}", node.name_any(), error).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn with_conditions(pairs: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(
                    pairs
                        .iter()
                        .map(|(type_, status)| NodeCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_the_force_flag() {
        let plain: UnrecoverableCondition = "KernelDeadlock".parse().unwrap();
        assert_eq!(plain.condition_type, "KernelDeadlock");
        assert!(!plain.force_evict);
        let forced: UnrecoverableCondition = "OutOfDisk:force".parse().unwrap();
        assert!(forced.force_evict);
        assert!("OutOfDisk:gently".parse::<UnrecoverableCondition>().is_err());
    }

    #[test]
    fn only_true_conditions_offend() {
        let configured = vec![
            UnrecoverableCondition {
                condition_type: "KernelDeadlock".to_string(),
                force_evict: true,
            },
            UnrecoverableCondition {
                condition_type: "OutOfDisk".to_string(),
                force_evict: false,
            },
        ];
        let node = with_conditions(&[("KernelDeadlock", "False"), ("OutOfDisk", "True")]);
        let hits = offending(&node, &configured);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].condition_type, "OutOfDisk");
        assert!(!hits.iter().any(|c| c.force_evict));
    }

    #[test]
    fn nodes_without_status_never_offend() {
        let configured = vec![UnrecoverableCondition {
            condition_type: "KernelDeadlock".to_string(),
            force_evict: true,
        }];
        assert!(offending(&Node::default(), &configured).is_empty());
    }
}

use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::conditions::{
    get_nla_condition, remove_pod_condition, set_or_update_pod_condition,
};
use crate::kubernetes::taints::is_drain_candidate;
use crate::kubernetes::{PodFilterFunc, index};
use crate::util::{Error, PROBE_INTERVAL};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Parallelism of the node reconciler.
const SYNC_CONCURRENCY: u16 = 2;

/// Context injected with each `reconcile` and `on_error` invocation.
struct ContextData {
    k8s: ThrottledClient,
    filter: PodFilterFunc,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(k8s: ThrottledClient, filter: PodFilterFunc) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                k8s,
                filter,
                metrics: ControllerMetrics::new("pod_sync"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { k8s, filter }
        }
    }
}

/// Maps a pod event to the pod's node. Pods with no node assignment are
/// ignored. Any pod change triggers its node, so freshly declared
/// pre-activity annotations are picked up without waiting for a node event.
fn pod_to_node(pod: Pod) -> Option<ObjectRef<Node>> {
    pod.spec
        .as_ref()?
        .node_name
        .as_deref()
        .map(ObjectRef::new)
}

/// Entrypoint for the taint→pod-condition synchronizer.
pub async fn run(k8s: ThrottledClient, filter: PodFilterFunc, token: CancellationToken) {
    println!("{}", "⚙️ Starting pod-condition synchronizer...".green());
    let context = Arc::new(ContextData::new(k8s.clone(), filter));
    let nodes: Api<Node> = Api::all(k8s.raw());
    let pods: Api<Pod> = Api::all(k8s.raw());
    let controller = Controller::new(nodes, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(SYNC_CONCURRENCY))
        .watches(pods, watcher::Config::default(), pod_to_node)
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {});
    tokio::select! {
        _ = token.cancelled() => {}
        _ = controller => {}
    }
    println!("{}", "🛑 Pod-condition synchronizer stopped".red());
}

/// Mirrors the node's drain taint onto every filtered pod as the
/// node-lifecycle condition. Per-pod errors are collected into one joined
/// error while the remaining pods are still processed.
async fn reconcile(node: Arc<Node>, context: Arc<ContextData>) -> Result<Action, Error> {
    let name = node.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name])
        .inc();
    #[cfg(feature = "metrics")]
    let timer = context
        .metrics
        .reconcile_histogram
        .with_label_values(&[&name])
        .start_timer();

    let desired = is_drain_candidate(&node);
    let pods = index::pods_on_node(&context.k8s, &name).await?;
    let now = Time(Timestamp::now());
    let mut total = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for pod in pods.iter().filter(|p| (context.filter)(p)) {
        total += 1;
        let outcome = if desired {
            set_or_update_pod_condition(context.k8s.acquire().await, pod, now.clone()).await
        } else if get_nla_condition(pod).is_some() {
            remove_pod_condition(context.k8s.acquire().await, pod).await
        } else {
            Ok(())
        };
        if let Err(e) = outcome {
            errors.push(format!(
                "{}/{}: {}",
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.name_any(),
                e
            ));
        }
    }

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    if !errors.is_empty() {
        #[cfg(feature = "metrics")]
        context
            .metrics
            .error_counter
            .with_label_values(&[&name])
            .inc();
        return Err(Error::PodSync {
            failed: errors.len(),
            total,
            errors,
        });
    }
    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Requeues the node shortly after a failed reconcile.
fn on_error(node: Arc<Node>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Pod sync error on node '{}': {}", node.name_any(), error).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    #[test]
    fn unscheduled_pods_do_not_map_to_a_node() {
        assert!(pod_to_node(Pod::default()).is_none());
        let pod = Pod {
            spec: Some(PodSpec {
                node_name: None,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_to_node(pod).is_none());
    }

    #[test]
    fn scheduled_pods_map_to_their_node() {
        let pod = Pod {
            spec: Some(PodSpec {
                node_name: Some("worker-7".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reference = pod_to_node(pod).expect("mapped");
        assert_eq!(reference.name, "worker-7");
    }
}

use crate::kubernetes::PodFilterFunc;
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::index;
use crate::util::Error;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, EvictParams},
};
use owo_colors::OwoColorize;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

// Evictions against a tight PodDisruptionBudget are rejected with 429 (and
// with 500 when budgets are misconfigured); kubectl drain waits 5 s between
// attempts and so do we.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const MAX_EVICTION_ATTEMPTS: usize = 10;

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_TIMEOUT: Duration = Duration::from_secs(600);

/// Removes the workloads from a node. The pipeline invokes it through this
/// interface so alternative eviction strategies can plug in.
#[async_trait]
pub trait Drainer: Send + Sync {
    /// Evicts every filtered pod from the node, respecting disruption
    /// budgets.
    async fn drain(&self, node: &Node, token: &CancellationToken) -> Result<(), Error>;

    /// Last-resort removal for unrecoverable nodes: deletes pods without
    /// waiting for graceful termination.
    async fn force_drain(&self, node: &Node, token: &CancellationToken) -> Result<(), Error>;
}

/// Skips pods that draining cannot or should not move: DaemonSet pods (their
/// controller ignores the taint and would fight us), static mirror pods, and
/// pods that already ran to completion.
pub fn default_pod_filter(pod: &Pod) -> bool {
    if let Some(phase) = pod.status.as_ref().and_then(|s| s.phase.as_deref())
        && ["Succeeded", "Failed"].contains(&phase)
    {
        return false;
    }
    if let Some(owners) = pod.metadata.owner_references.as_ref()
        && owners
            .iter()
            .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
    {
        return false;
    }
    if let Some(annotations) = pod.metadata.annotations.as_ref()
        && annotations.contains_key("kubernetes.io/config.mirror")
    {
        return false;
    }
    true
}

/// Eviction-based drainer honoring PodDisruptionBudgets.
pub struct EvictionDrainer {
    k8s: ThrottledClient,
    filter: PodFilterFunc,
    max_concurrent: usize,
}

impl EvictionDrainer {
    pub fn new(k8s: ThrottledClient, filter: PodFilterFunc, max_concurrent: usize) -> Self {
        Self {
            k8s,
            filter,
            max_concurrent,
        }
    }

    async fn targets(&self, node: &Node) -> Result<Vec<Pod>, Error> {
        let node_name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::UserInput("Node is missing metadata.name".to_string()))?;
        let pods = index::pods_on_node(&self.k8s, node_name).await?;
        Ok(pods.into_iter().filter(|p| (self.filter)(p)).collect())
    }

    async fn evict_pod(&self, pod: &Pod, token: &CancellationToken) -> Result<(), Error> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.name_any();
        for _attempt in 0..MAX_EVICTION_ATTEMPTS {
            let api: Api<Pod> = Api::namespaced(self.k8s.acquire().await, namespace);
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => return Ok(()),
                // Already gone; nothing left to evict.
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 429 || ae.code == 500 => {
                    println!(
                        "{}",
                        format!(
                            "⏳ eviction of '{}/{}' rejected ({}); retrying in {:?}",
                            namespace, name, ae.code, EVICTION_RETRY_INTERVAL
                        )
                        .yellow()
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(EVICTION_RETRY_INTERVAL) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::EvictionStalled(format!("{}/{}", namespace, name)))
    }

    async fn wait_for_deletion(&self, pod: &Pod, token: &CancellationToken) -> Result<(), Error> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.name_any();
        let started = Instant::now();
        loop {
            let api: Api<Pod> = Api::namespaced(self.k8s.acquire().await, namespace);
            match api.get(&name).await {
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    eprintln!(
                        "{}",
                        format!(
                            "⚠️ could not check deletion of '{}/{}': {}",
                            namespace, name, e
                        )
                        .yellow()
                    );
                }
            }
            if started.elapsed() > DELETION_TIMEOUT {
                return Err(Error::UserInput(format!(
                    "pod '{}/{}' was not deleted within {:?}",
                    namespace, name, DELETION_TIMEOUT
                )));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = sleep(DELETION_CHECK_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Drainer for EvictionDrainer {
    async fn drain(&self, node: &Node, token: &CancellationToken) -> Result<(), Error> {
        let targets = self.targets(node).await?;
        println!(
            "{}",
            format!(
                "🚰 evicting {} pods from node '{}'",
                targets.len(),
                node.name_any()
            )
            .cyan()
        );
        let failures: Vec<String> = stream::iter(targets)
            .map(|pod| async move {
                let outcome = match self.evict_pod(&pod, token).await {
                    Ok(()) => self.wait_for_deletion(&pod, token).await,
                    Err(e) => Err(e),
                };
                outcome.err().map(|e| format!("{}: {}", pod.name_any(), e))
            })
            .buffer_unordered(self.max_concurrent)
            .filter_map(|failure| async move { failure })
            .collect()
            .await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Drain {
                node: node.name_any(),
                failures,
            })
        }
    }

    async fn force_drain(&self, node: &Node, token: &CancellationToken) -> Result<(), Error> {
        let targets = self.targets(node).await?;
        println!(
            "{}",
            format!(
                "🧨 force-deleting {} pods from node '{}'",
                targets.len(),
                node.name_any()
            )
            .red()
        );
        let mut failures = Vec::new();
        for pod in targets {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
            let api: Api<Pod> = Api::namespaced(self.k8s.acquire().await, namespace);
            match api
                .delete(&pod.name_any(), &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => failures.push(format!("{}: {}", pod.name_any(), e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Drain {
                node: node.name_any(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn pod() -> Pod {
        Pod::default()
    }

    fn owned_by(kind: &str, controller: bool) -> Pod {
        let mut pod = pod();
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "uid".to_string(),
            controller: Some(controller),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn plain_pods_are_eligible() {
        assert!(default_pod_filter(&pod()));
    }

    #[test]
    fn daemonset_pods_are_skipped_only_when_controlling() {
        assert!(!default_pod_filter(&owned_by("DaemonSet", true)));
        assert!(default_pod_filter(&owned_by("DaemonSet", false)));
        assert!(default_pod_filter(&owned_by("ReplicaSet", true)));
    }

    #[test]
    fn mirror_pods_are_skipped() {
        let mut p = pod();
        p.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/config.mirror".to_string(),
            "checksum".to_string(),
        )]));
        assert!(!default_pod_filter(&p));
    }

    #[test]
    fn completed_pods_are_skipped() {
        for phase in ["Succeeded", "Failed"] {
            let mut p = pod();
            p.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            assert!(!default_pod_filter(&p));
        }
    }
}

use super::GroupKeyFunc;
use super::client::ThrottledClient;
use crate::util::Error;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, api::ListParams};

/// Lists every node in the cluster.
pub async fn list_nodes(k8s: &ThrottledClient) -> Result<Vec<Node>, Error> {
    let api: Api<Node> = Api::all(k8s.acquire().await);
    let nodes = api.list(&ListParams::default()).await?;
    Ok(nodes.items)
}

/// Nodes belonging to `group_key` under the given grouping function.
pub async fn nodes_in_group(
    k8s: &ThrottledClient,
    group: &GroupKeyFunc,
    group_key: &str,
) -> Result<Vec<Node>, Error> {
    let nodes = list_nodes(k8s).await?;
    Ok(nodes.into_iter().filter(|n| group(n) == group_key).collect())
}

/// Pods scheduled on the given node, resolved through the `spec.nodeName`
/// field selector so the apiserver index does the work.
pub async fn pods_on_node(k8s: &ThrottledClient, node_name: &str) -> Result<Vec<Pod>, Error> {
    let api: Api<Pod> = Api::all(k8s.acquire().await);
    let pods = api
        .list(&ListParams {
            field_selector: Some(format!("spec.nodeName={}", node_name)),
            ..Default::default()
        })
        .await?;
    Ok(pods.items)
}

use super::MANAGER_NAME;
use crate::util::Error;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};

/// Patch a cluster-scoped Node with the provided mutation. The function is
/// passed a mutable clone of the node, and the resulting JSON diff is applied
/// server-side. Mutations that change nothing skip the API round-trip.
pub async fn patch_node(
    client: Client,
    node: &Node,
    f: impl FnOnce(&mut Node),
) -> Result<Node, Error> {
    let mut modified = node.clone();
    f(&mut modified);
    let diff = json_patch::diff(
        &serde_json::to_value(node)?,
        &serde_json::to_value(&modified)?,
    );
    if diff.0.is_empty() {
        return Ok(modified);
    }
    let name = node
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Node is missing metadata.name".to_string()))?;
    let api: Api<Node> = Api::all(client);
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<Node>(diff))
        .await?)
}

/// Patch only the status subresource of a Pod with the provided mutation.
pub async fn patch_pod_status(
    client: Client,
    pod: &Pod,
    f: impl FnOnce(&mut Pod),
) -> Result<Pod, Error> {
    let mut modified = pod.clone();
    f(&mut modified);
    let diff = json_patch::diff(
        &serde_json::to_value(pod)?,
        &serde_json::to_value(&modified)?,
    );
    if diff.0.is_empty() {
        return Ok(modified);
    }
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pod is missing metadata.name".to_string()))?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pod is missing metadata.namespace".to_string()))?;
    let api: Api<Pod> = Api::namespaced(client, namespace);
    Ok(api
        .patch_status(name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<Pod>(diff))
        .await?)
}

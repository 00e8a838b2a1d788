use crate::kubernetes::client::ThrottledClient;
use crate::util::{Error, MANAGER_NAME};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api,
    api::{Patch, PatchParams},
};

/// Key under which the serialized drain-buffer cache lives in the ConfigMap.
pub const DATA_KEY: &str = "drain_buffer.json";

/// Durable store for the drain-buffer cache: one JSON document in a
/// cluster-visible ConfigMap addressed by `(name, namespace)`.
#[derive(Clone)]
pub struct ConfigMapPersistor {
    k8s: ThrottledClient,
    name: String,
    namespace: String,
}

impl ConfigMapPersistor {
    pub fn new(k8s: ThrottledClient, name: String, namespace: String) -> Self {
        Self {
            k8s,
            name,
            namespace,
        }
    }

    /// Loads the persisted blob. A missing ConfigMap or data key yields
    /// `None`; the cache then starts empty.
    pub async fn load(&self) -> Result<Option<String>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.k8s.acquire().await, &self.namespace);
        match api.get(&self.name).await {
            Ok(cm) => Ok(cm.data.and_then(|data| data.get(DATA_KEY).cloned())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the blob, creating the ConfigMap on first persist and
    /// overwriting it afterwards.
    pub async fn persist(&self, blob: String) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.k8s.acquire().await, &self.namespace);
        let content = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "data": { DATA_KEY: blob },
        });
        api.patch(
            &self.name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&content),
        )
        .await?;
        Ok(())
    }
}

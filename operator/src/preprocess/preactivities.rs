use super::{NotDoneReason, PreProcessResult, PreProcessor};
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::events::{
    EventSink, PRE_ACTIVITY_BAD_CONFIGURATION, PRE_ACTIVITY_FAILED, object_ref,
};
use crate::kubernetes::taints::{candidate_since, drain_state};
use crate::kubernetes::{PRE_ACTIVITY_PREFIX, PRE_ACTIVITY_TIMEOUT_PREFIX, index};
use crate::util::{Error, patch::patch_node};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::jiff::Timestamp;
use kube::core::NamespaceResourceScope;
use kube::{Api, Resource, ResourceExt};
use owo_colors::OwoColorize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// State parsed from a pre-activity annotation value. The empty string means
/// the external automation has not picked the activity up yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityState {
    NotStarted,
    Processing,
    Done,
    Failed,
}

impl ActivityState {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(ActivityState::NotStarted),
            "processing" => Some(ActivityState::Processing),
            "done" => Some(ActivityState::Done),
            "failed" => Some(ActivityState::Failed),
            _ => None,
        }
    }
}

/// One pre-activity discovered during the walk. The same suffix declared on
/// different objects yields independent entries because the key carries the
/// object id.
#[derive(Clone, Debug, PartialEq)]
pub struct Activity {
    pub key: String,
    pub state: ActivityState,
    pub timeout: Option<Duration>,
}

/// Invalid annotation found on one of the walked objects; surfaced as a
/// warning event instead of blocking the pipeline.
pub(crate) struct BadConfiguration {
    pub source: ObjectReference,
    pub note: String,
}

#[derive(Default)]
pub(crate) struct Discovered {
    pub activities: Vec<Activity>,
    pub bad: Vec<BadConfiguration>,
    pub orphan_timeouts: Vec<String>,
}

impl Discovered {
    fn merge(&mut self, other: Discovered) {
        self.activities.extend(other.activities);
        self.bad.extend(other.bad);
        self.orphan_timeouts.extend(other.orphan_timeouts);
    }
}

/// Parses the pre-activity annotations of one object.
pub(crate) fn collect_from_annotations(
    annotations: &BTreeMap<String, String>,
    object_id: &str,
    source: &ObjectReference,
) -> Discovered {
    let mut out = Discovered::default();
    let mut timeouts: BTreeMap<&str, Duration> = BTreeMap::new();
    for (key, value) in annotations {
        let Some(suffix) = key.strip_prefix(PRE_ACTIVITY_TIMEOUT_PREFIX) else {
            continue;
        };
        match parse_duration::parse(value) {
            Ok(timeout) => {
                timeouts.insert(suffix, timeout);
            }
            Err(e) => out.bad.push(BadConfiguration {
                source: source.clone(),
                note: format!(
                    "invalid timeout '{}' for pre-activity '{}': {}",
                    value, suffix, e
                ),
            }),
        }
    }
    for (key, value) in annotations {
        let Some(suffix) = key.strip_prefix(PRE_ACTIVITY_PREFIX) else {
            continue;
        };
        let timeout = timeouts.remove(suffix);
        match ActivityState::parse(value) {
            Some(state) => out.activities.push(Activity {
                key: format!("{}/{}", object_id, suffix),
                state,
                timeout,
            }),
            None => out.bad.push(BadConfiguration {
                source: source.clone(),
                note: format!("invalid pre-activity state '{}' for '{}'", value, suffix),
            }),
        }
    }
    for suffix in timeouts.into_keys() {
        out.orphan_timeouts
            .push(format!("{}/{}", object_id, suffix));
    }
    out
}

pub(crate) enum ActivityVerdict {
    AllDone,
    Blocked {
        reason: NotDoneReason,
        culprit: String,
    },
}

/// Folds the outstanding activities into one verdict. A worse reason always
/// wins: failure over timeout over processing. The first failure encountered
/// short-circuits the scan.
pub(crate) fn evaluate(
    activities: &[Activity],
    since: Timestamp,
    now: Timestamp,
    default_timeout: Duration,
) -> ActivityVerdict {
    let mut worst: Option<(NotDoneReason, String)> = None;
    for activity in activities {
        let observed = match activity.state {
            ActivityState::Done => continue,
            ActivityState::Failed => (NotDoneReason::Failure, activity.key.clone()),
            ActivityState::NotStarted | ActivityState::Processing => {
                let timeout = activity.timeout.unwrap_or(default_timeout);
                if now.duration_since(since).as_secs() > timeout.as_secs() as i64 {
                    (NotDoneReason::Timeout, activity.key.clone())
                } else {
                    (NotDoneReason::Processing, activity.key.clone())
                }
            }
        };
        if worst.as_ref().is_none_or(|(reason, _)| observed.0 > *reason) {
            worst = Some(observed);
        }
        if matches!(worst, Some((NotDoneReason::Failure, _))) {
            break;
        }
    }
    match worst {
        None => ActivityVerdict::AllDone,
        Some((reason, culprit)) => ActivityVerdict::Blocked { reason, culprit },
    }
}

fn controller_owner(refs: Option<&[OwnerReference]>) -> Option<&OwnerReference> {
    refs?.iter().find(|r| r.controller == Some(true))
}

fn source_parts<K>(
    kind: &str,
    api_version: &str,
    namespace: &str,
    obj: &K,
) -> (String, BTreeMap<String, String>, ObjectReference)
where
    K: Resource,
    K::DynamicType: Default,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    let reference = ObjectReference {
        api_version: Some(api_version.to_string()),
        kind: Some(kind.to_string()),
        name: Some(name.clone()),
        namespace: Some(namespace.to_string()),
        uid: obj.meta().uid.clone(),
        ..Default::default()
    };
    (
        format!("{}/{}/{}", kind.to_lowercase(), namespace, name),
        obj.annotations().clone(),
        reference,
    )
}

/// Gates candidates on operator-declared pre-activities, discovered on the
/// node, on every pod scheduled on it, and on the top-most controller owning
/// each pod.
pub struct PreActivitiesPreProcessor {
    k8s: ThrottledClient,
    events: EventSink,
    default_timeout: Duration,
}

impl PreActivitiesPreProcessor {
    pub fn new(k8s: ThrottledClient, events: EventSink, default_timeout: Duration) -> Self {
        Self {
            k8s,
            events,
            default_timeout,
        }
    }

    async fn fetch_source<K>(
        &self,
        kind: &str,
        api_version: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(String, BTreeMap<String, String>, ObjectReference)>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.k8s.acquire().await, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(source_parts(kind, api_version, namespace, &obj))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn controller_source(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(String, BTreeMap<String, String>, ObjectReference)>, Error> {
        match kind {
            "Deployment" => {
                self.fetch_source::<Deployment>("Deployment", "apps/v1", namespace, name)
                    .await
            }
            "StatefulSet" => {
                self.fetch_source::<StatefulSet>("StatefulSet", "apps/v1", namespace, name)
                    .await
            }
            "DaemonSet" => {
                self.fetch_source::<DaemonSet>("DaemonSet", "apps/v1", namespace, name)
                    .await
            }
            "ReplicaSet" => {
                self.fetch_source::<ReplicaSet>("ReplicaSet", "apps/v1", namespace, name)
                    .await
            }
            "Job" => {
                self.fetch_source::<Job>("Job", "batch/v1", namespace, name)
                    .await
            }
            _ => Ok(None),
        }
    }

    /// Resolves the top-most controller owning the pod: a pod owned by a
    /// ReplicaSet that is itself owned by a Deployment reports the
    /// Deployment.
    async fn top_controller(
        &self,
        pod: &Pod,
    ) -> Result<Option<(String, BTreeMap<String, String>, ObjectReference)>, Error> {
        let Some(namespace) = pod.metadata.namespace.as_deref() else {
            return Ok(None);
        };
        let Some(owner) = controller_owner(pod.metadata.owner_references.as_deref()) else {
            return Ok(None);
        };
        if owner.kind == "ReplicaSet" {
            let api: Api<ReplicaSet> = Api::namespaced(self.k8s.acquire().await, namespace);
            let rs = match api.get(&owner.name).await {
                Ok(rs) => rs,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if let Some(rs_owner) = controller_owner(rs.metadata.owner_references.as_deref())
                && rs_owner.kind == "Deployment"
            {
                let name = rs_owner.name.clone();
                return self.controller_source("Deployment", namespace, &name).await;
            }
            return Ok(Some(source_parts("ReplicaSet", "apps/v1", namespace, &rs)));
        }
        self.controller_source(&owner.kind, namespace, &owner.name)
            .await
    }

    async fn discover(&self, node: &Node) -> Result<Discovered, Error> {
        let node_name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::UserInput("Node is missing metadata.name".to_string()))?;
        let empty = BTreeMap::new();
        let mut out = Discovered::default();
        out.merge(collect_from_annotations(
            node.metadata.annotations.as_ref().unwrap_or(&empty),
            &format!("node/{}", node_name),
            &object_ref(node),
        ));
        let pods = index::pods_on_node(&self.k8s, node_name).await?;
        let mut seen_controllers: HashSet<String> = HashSet::new();
        for pod in &pods {
            let pod_id = format!(
                "pod/{}/{}",
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
            );
            out.merge(collect_from_annotations(
                pod.metadata.annotations.as_ref().unwrap_or(&empty),
                &pod_id,
                &object_ref(pod),
            ));
            if let Some((id, annotations, reference)) = self.top_controller(pod).await?
                && seen_controllers.insert(id.clone())
            {
                out.merge(collect_from_annotations(&annotations, &id, &reference));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PreProcessor for PreActivitiesPreProcessor {
    fn name(&self) -> &'static str {
        "pre-activities"
    }

    async fn is_done(&self, node: &Node) -> Result<PreProcessResult, Error> {
        if drain_state(node).is_none() {
            return Ok(PreProcessResult::NotDone(NotDoneReason::NotCandidate));
        }
        let Some(since) = candidate_since(node) else {
            return Ok(PreProcessResult::NotDone(NotDoneReason::NotCandidate));
        };
        let discovered = self.discover(node).await?;
        for bad in &discovered.bad {
            self.events
                .warn(&bad.source, PRE_ACTIVITY_BAD_CONFIGURATION, bad.note.clone())
                .await;
        }
        for orphan in &discovered.orphan_timeouts {
            eprintln!(
                "{}",
                format!(
                    "⚠️ pre-activity timeout without a matching state annotation: {}",
                    orphan
                )
                .yellow()
            );
        }
        match evaluate(
            &discovered.activities,
            since,
            Timestamp::now(),
            self.default_timeout,
        ) {
            ActivityVerdict::AllDone => Ok(PreProcessResult::Done),
            ActivityVerdict::Blocked {
                reason: NotDoneReason::Processing,
                ..
            } => Ok(PreProcessResult::NotDone(NotDoneReason::Processing)),
            ActivityVerdict::Blocked { reason, culprit } => {
                self.events
                    .warn(
                        &object_ref(node),
                        PRE_ACTIVITY_FAILED,
                        format!("pre-activity '{}' reported {}", culprit, reason),
                    )
                    .await;
                Ok(PreProcessResult::NotDone(reason))
            }
        }
    }

    /// Blanks the node-scoped pre-activity states so they restart on the next
    /// attempt. Pod- and controller-scoped activities belong to their owners
    /// and are left alone.
    async fn reset(&self, node: &Node) -> Result<(), Error> {
        patch_node(self.k8s.acquire().await, node, |n| {
            if let Some(annotations) = n.metadata.annotations.as_mut() {
                for (key, value) in annotations.iter_mut() {
                    if key.starts_with(PRE_ACTIVITY_PREFIX) {
                        value.clear();
                    }
                }
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn state_key(suffix: &str) -> String {
        format!("{}{}", PRE_ACTIVITY_PREFIX, suffix)
    }

    fn timeout_key(suffix: &str) -> String {
        format!("{}{}", PRE_ACTIVITY_TIMEOUT_PREFIX, suffix)
    }

    fn activity(key: &str, state: ActivityState, timeout: Option<Duration>) -> Activity {
        Activity {
            key: key.to_string(),
            state,
            timeout,
        }
    }

    #[test]
    fn empty_value_parses_as_not_started() {
        assert_eq!(ActivityState::parse(""), Some(ActivityState::NotStarted));
        assert_eq!(ActivityState::parse("done"), Some(ActivityState::Done));
        assert_eq!(ActivityState::parse("Done"), None);
    }

    #[test]
    fn collect_pairs_timeouts_with_their_state() {
        let source = ObjectReference::default();
        let state = state_key("db-snapshot");
        let timeout = timeout_key("db-snapshot");
        let out = collect_from_annotations(
            &annotations(&[
                (state.as_str(), "processing"),
                (timeout.as_str(), "30m"),
                ("unrelated.io/annotation", "x"),
            ]),
            "node/n1",
            &source,
        );
        assert_eq!(
            out.activities,
            vec![activity(
                "node/n1/db-snapshot",
                ActivityState::Processing,
                Some(Duration::from_secs(1800)),
            )]
        );
        assert!(out.bad.is_empty());
        assert!(out.orphan_timeouts.is_empty());
    }

    #[test]
    fn collect_flags_invalid_values_and_keeps_going() {
        let source = ObjectReference::default();
        let state_a = state_key("a");
        let timeout_b = timeout_key("b");
        let state_b = state_key("b");
        let out = collect_from_annotations(
            &annotations(&[
                (state_a.as_str(), "nope"),
                (timeout_b.as_str(), "soonish"),
                (state_b.as_str(), "done"),
            ]),
            "node/n1",
            &source,
        );
        assert_eq!(out.bad.len(), 2);
        assert_eq!(
            out.activities,
            vec![activity("node/n1/b", ActivityState::Done, None)]
        );
    }

    #[test]
    fn collect_reports_timeouts_without_a_state() {
        let source = ObjectReference::default();
        let timeout = timeout_key("ghost");
        let out = collect_from_annotations(
            &annotations(&[(timeout.as_str(), "5m")]),
            "pod/ns/p1",
            &source,
        );
        assert!(out.activities.is_empty());
        assert_eq!(out.orphan_timeouts, vec!["pod/ns/p1/ghost".to_string()]);
    }

    #[test]
    fn same_suffix_on_different_objects_stays_independent() {
        let source = ObjectReference::default();
        let state = state_key("db-snapshot");
        let mut out = collect_from_annotations(
            &annotations(&[(state.as_str(), "processing")]),
            "node/n1",
            &source,
        );
        out.merge(collect_from_annotations(
            &annotations(&[(state.as_str(), "failed")]),
            "deployment/ns/web",
            &source,
        ));
        let keys: Vec<&str> = out.activities.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, vec!["node/n1/db-snapshot", "deployment/ns/web/db-snapshot"]);
    }

    #[test]
    fn failure_dominates_timeout_dominates_processing() {
        let since = Timestamp::UNIX_EPOCH;
        let now = Timestamp::from_second(1200).unwrap();
        let default_timeout = Duration::from_secs(600);
        let activities = vec![
            // Still within its generous private timeout.
            activity("a", ActivityState::Processing, Some(Duration::from_secs(3600))),
            // Past the default timeout.
            activity("b", ActivityState::NotStarted, None),
            activity("c", ActivityState::Failed, None),
        ];
        match evaluate(&activities, since, now, default_timeout) {
            ActivityVerdict::Blocked { reason, culprit } => {
                assert_eq!(reason, NotDoneReason::Failure);
                assert_eq!(culprit, "c");
            }
            ActivityVerdict::AllDone => panic!("expected a blocked verdict"),
        }
        match evaluate(&activities[..2], since, now, default_timeout) {
            ActivityVerdict::Blocked { reason, culprit } => {
                assert_eq!(reason, NotDoneReason::Timeout);
                assert_eq!(culprit, "b");
            }
            ActivityVerdict::AllDone => panic!("expected a blocked verdict"),
        }
        match evaluate(&activities[..1], since, now, default_timeout) {
            ActivityVerdict::Blocked { reason, .. } => {
                assert_eq!(reason, NotDoneReason::Processing)
            }
            ActivityVerdict::AllDone => panic!("expected a blocked verdict"),
        }
    }

    #[test]
    fn done_activities_are_invisible() {
        let activities = vec![
            activity("a", ActivityState::Done, None),
            activity("b", ActivityState::Done, Some(Duration::from_secs(1))),
        ];
        assert!(matches!(
            evaluate(
                &activities,
                Timestamp::UNIX_EPOCH,
                Timestamp::from_second(999_999).unwrap(),
                Duration::from_secs(600),
            ),
            ActivityVerdict::AllDone
        ));
    }
}

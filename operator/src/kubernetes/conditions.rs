use crate::util::{Error, patch::patch_pod_status};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Client;

/// Pod condition mirroring the drain-candidate state of the pod's node.
pub const NLA_CONDITION_TYPE: &str = "NodeLifecycle";
pub const NLA_CONDITION_REASON: &str = "NodeDrainCandidate";
pub const NLA_CONDITION_MESSAGE: &str = "The node hosting this pod is scheduled for drain";

/// Returns the node-lifecycle condition carried by the pod, if any.
pub fn get_nla_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == NLA_CONDITION_TYPE)
}

/// Adds the condition, or refreshes `last_probe_time` when already present.
/// `last_transition_time` only moves when the condition first appears.
pub(crate) fn set_nla_condition(pod: &mut Pod, now: Time) {
    let status = pod.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Default::default);
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == NLA_CONDITION_TYPE) {
        existing.last_probe_time = Some(now);
        return;
    }
    conditions.push(PodCondition {
        type_: NLA_CONDITION_TYPE.to_string(),
        status: "True".to_string(),
        reason: Some(NLA_CONDITION_REASON.to_string()),
        message: Some(NLA_CONDITION_MESSAGE.to_string()),
        last_probe_time: Some(now.clone()),
        last_transition_time: Some(now),
        observed_generation: None,
    });
}

/// Drops the condition; true when the pod carried it.
pub(crate) fn clear_nla_condition(pod: &mut Pod) -> bool {
    let Some(conditions) = pod
        .status
        .as_mut()
        .and_then(|status| status.conditions.as_mut())
    else {
        return false;
    };
    let before = conditions.len();
    conditions.retain(|c| c.type_ != NLA_CONDITION_TYPE);
    before != conditions.len()
}

/// Idempotently writes the condition through the status subresource.
pub async fn set_or_update_pod_condition(
    client: Client,
    pod: &Pod,
    now: Time,
) -> Result<(), Error> {
    patch_pod_status(client, pod, |p| set_nla_condition(p, now)).await?;
    Ok(())
}

/// Idempotently removes the condition through the status subresource.
pub async fn remove_pod_condition(client: Client, pod: &Pod) -> Result<(), Error> {
    patch_pod_status(client, pod, |p| {
        clear_nla_condition(p);
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::jiff::Timestamp;

    fn ts(seconds: i64) -> Time {
        Time(Timestamp::from_second(seconds).unwrap())
    }

    #[test]
    fn condition_appears_with_both_timestamps() {
        let mut pod = Pod::default();
        set_nla_condition(&mut pod, ts(100));
        let condition = get_nla_condition(&pod).expect("condition set");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason.as_deref(), Some(NLA_CONDITION_REASON));
        assert_eq!(condition.last_probe_time, Some(ts(100)));
        assert_eq!(condition.last_transition_time, Some(ts(100)));
    }

    #[test]
    fn refresh_moves_probe_time_only() {
        let mut pod = Pod::default();
        set_nla_condition(&mut pod, ts(100));
        set_nla_condition(&mut pod, ts(160));
        let condition = get_nla_condition(&pod).expect("condition kept");
        assert_eq!(condition.last_probe_time, Some(ts(160)));
        assert_eq!(condition.last_transition_time, Some(ts(100)));
        let count = pod
            .status
            .as_ref()
            .unwrap()
            .conditions
            .as_ref()
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }

    #[test]
    fn clear_reports_whether_anything_changed() {
        let mut pod = Pod::default();
        assert!(!clear_nla_condition(&mut pod));
        set_nla_condition(&mut pod, ts(100));
        assert!(clear_nla_condition(&mut pod));
        assert!(get_nla_condition(&pod).is_none());
    }
}

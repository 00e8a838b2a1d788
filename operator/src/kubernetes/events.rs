use crate::util::MANAGER_NAME;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use owo_colors::OwoColorize;

/// Reason attached to events about misconfigured pre-activity annotations.
pub const PRE_ACTIVITY_BAD_CONFIGURATION: &str = "PreActivityBadConfiguration";
/// Reason attached to events about failed or timed-out pre-activities.
pub const PRE_ACTIVITY_FAILED: &str = "PreActivityFailed";

/// Publishes warning events; publish failures are logged, never propagated,
/// so a flaky events endpoint cannot stall the pipeline.
#[derive(Clone)]
pub struct EventSink {
    recorder: Recorder,
}

impl EventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: MANAGER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn warn(&self, reference: &ObjectReference, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Draining".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            eprintln!(
                "{}",
                format!("⚠️ failed to publish {} event: {}", reason, e).yellow()
            );
        }
    }
}

/// Builds an event reference for any typed cluster object.
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: kube::Resource,
    K::DynamicType: Default,
{
    obj.object_ref(&K::DynamicType::default())
}

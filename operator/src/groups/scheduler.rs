use super::{DrainRunner, RunnerContext};
use crate::kubernetes::taints::is_drain_candidate;
use crate::kubernetes::{GroupKeyFunc, index};
use k8s_openapi::api::core::v1::Node;
use owo_colors::OwoColorize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the scheduler re-discovers active group keys.
const SCHEDULE_INTERVAL: Duration = Duration::from_secs(10);

/// Group keys that currently have at least one drain candidate.
pub(crate) fn active_group_keys(nodes: &[Node], group: &GroupKeyFunc) -> BTreeSet<String> {
    nodes
        .iter()
        .filter(|n| is_drain_candidate(n))
        .map(|n| group(n))
        .collect()
}

/// Keeps exactly one drain runner alive per active group key. Runners cancel
/// their own token once their group has no candidates left; the scheduler
/// reaps the finished entry on its next tick.
pub struct GroupScheduler {
    ctx: RunnerContext,
}

impl GroupScheduler {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, token: CancellationToken) {
        println!("{}", "⚙️ Starting group scheduler...".green());
        let mut runners: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut tick = tokio::time::interval(SCHEDULE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            runners.retain(|key, handle| {
                if handle.is_finished() {
                    println!(
                        "{}{}",
                        "🧹 Reaped drain runner • group=".dimmed(),
                        key.cyan(),
                    );
                    false
                } else {
                    true
                }
            });
            let nodes = match index::list_nodes(&self.ctx.k8s).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    eprintln!(
                        "{}",
                        format!("⚠️ group discovery failed (will retry): {}", e).yellow()
                    );
                    continue;
                }
            };
            for key in active_group_keys(&nodes, &self.ctx.group) {
                if runners.contains_key(&key) {
                    continue;
                }
                let runner = DrainRunner::new(self.ctx.clone(), key.clone());
                let handle = tokio::spawn(runner.run(token.child_token()));
                runners.insert(key, handle);
            }
        }
        // Parent cancellation reaches every child token; wait the runners out.
        for (_, handle) in runners {
            handle.await.ok();
        }
        println!("{}", "🛑 Group scheduler stopped".red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::group_key_from_label;
    use crate::kubernetes::taints::{DRAIN_TAINT_EFFECT, DRAIN_TAINT_KEY};
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(zone: Option<&str>, taint_value: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                labels: zone.map(|z| {
                    BTreeMap::from([("topology.kubernetes.io/zone".to_string(), z.to_string())])
                }),
                ..Default::default()
            },
            spec: taint_value.map(|value| NodeSpec {
                taints: Some(vec![Taint {
                    key: DRAIN_TAINT_KEY.to_string(),
                    value: Some(value.to_string()),
                    effect: DRAIN_TAINT_EFFECT.to_string(),
                    time_added: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_groups_with_candidates_are_active() {
        let group = group_key_from_label("topology.kubernetes.io/zone".to_string());
        let nodes = vec![
            node(Some("a"), Some("drain-candidate")),
            node(Some("a"), Some("draining")),
            node(Some("b"), Some("drained")),
            node(Some("c"), None),
            node(None, Some("drain-candidate")),
        ];
        let keys = active_group_keys(&nodes, &group);
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "default".to_string()]
        );
    }
}

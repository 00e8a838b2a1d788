use clap::Parser;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use node_lifecycle_common::{
    self as common,
    args::{
        DrainArgs, ForceDrainArgs, PersistorArgs, PreActivityArgs, RateLimiterArgs,
        ReplacementArgs, RetryWallArgs,
    },
    rate_limit::{RateLimiter, RateLimiterConfig},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

mod drain;
mod drainbuffer;
mod forcedrain;
mod groups;
mod kubernetes;
mod podsync;
mod preprocess;
mod retrywall;
mod util;

use crate::drain::{Drainer, EvictionDrainer, default_pod_filter};
use crate::drainbuffer::{ConfigMapPersistor, DrainBuffer};
use crate::forcedrain::UnrecoverableCondition;
use crate::groups::{GroupScheduler, RunnerContext};
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::events::EventSink;
use crate::kubernetes::{PodFilterFunc, group_key_from_label};
use crate::preprocess::{
    NodeReplacementPreProcessor, PreActivitiesPreProcessor, PreProcessor, WaitTimePreProcessor,
};
use crate::retrywall::RetryWall;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Drains cluster nodes that upstream health detectors marked unfit"
)]
struct Opts {
    #[clap(flatten)]
    drain: DrainArgs,

    #[clap(flatten)]
    replacement: ReplacementArgs,

    #[clap(flatten)]
    pre_activity: PreActivityArgs,

    #[clap(flatten)]
    retry_wall: RetryWallArgs,

    #[clap(flatten)]
    persistor: PersistorArgs,

    #[clap(flatten)]
    rate_limiter: RateLimiterArgs,

    #[clap(flatten)]
    force_drain: ForceDrainArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init();
    let opts = Opts::parse();

    #[cfg(feature = "metrics")]
    util::metrics::maybe_spawn_metrics_server();

    let unrecoverable: Vec<UnrecoverableCondition> = opts
        .force_drain
        .unrecoverable_conditions
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_, _>>()?;

    let client = kube::Client::try_default().await?;
    let limiter = RateLimiter::new(RateLimiterConfig::from(opts.rate_limiter.clone()));
    let k8s = ThrottledClient::new("node-lifecycle", client.clone(), limiter);
    let events = EventSink::new(client.clone());

    let group = group_key_from_label(opts.drain.group_key_label.clone());
    let filter: PodFilterFunc = Arc::new(default_pod_filter);
    let drainer: Arc<dyn Drainer> = Arc::new(EvictionDrainer::new(
        k8s.clone(),
        filter.clone(),
        opts.drain.max_concurrent_evictions,
    ));
    let buffer = DrainBuffer::new(ConfigMapPersistor::new(
        k8s.clone(),
        opts.persistor.drain_buffer_configmap.clone(),
        opts.persistor.namespace.clone(),
    ));
    let retry_wall = RetryWall::new(
        opts.retry_wall.retry_backoff_base,
        opts.retry_wall.retry_backoff_ceiling,
    );
    let preprocessors: Arc<Vec<Box<dyn PreProcessor>>> = Arc::new(vec![
        Box::new(NodeReplacementPreProcessor::new(
            k8s.clone(),
            opts.replacement.replace_by_default,
            opts.replacement.replacement_timeout,
        )),
        Box::new(WaitTimePreProcessor::new(opts.drain.min_wait)),
        Box::new(PreActivitiesPreProcessor::new(
            k8s.clone(),
            events.clone(),
            opts.pre_activity.default_pre_activity_timeout,
        )),
    ]);
    let runner_ctx = RunnerContext {
        k8s: k8s.clone(),
        group,
        preprocessors,
        drainer: drainer.clone(),
        buffer: buffer.clone(),
        retry_wall,
        drain_buffer_duration: opts.drain.drain_buffer,
        run_every: opts.drain.run_every,
    };

    // Namespace shared by the leader-election lease and the persistor, so
    // RBAC stays namespaced rather than cluster-scoped.
    let lease_namespace = opts.persistor.namespace.clone();
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("node-lifecycle-operator-{}", uuid::Uuid::new_v4()));
    let lease_name = "node-lifecycle-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = common::shutdown::shutdown_token();
    common::signal_ready();
    println!("{}", "🌱 Starting node-lifecycle operator...".green());

    // We run indefinitely; only the leader runs the controllers.
    // On leadership loss, we stop them and go back to standby.
    let mut components: Option<(CancellationToken, Vec<tokio::task::JoinHandle<()>>)> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((token, handles)) = components.take() {
                    token.cancel();
                    for handle in handles {
                        handle.await.ok();
                    }
                }
                break;
            }
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(e) => {
                // If we can't talk to the apiserver / update the Lease,
                // assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some((token, handles)) = components.take() {
                    token.cancel();
                    for handle in handles {
                        handle.abort();
                    }
                    eprintln!("stopped controllers due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure the controllers are running.
            if components.is_none() {
                println!("{}", "👑 Acquired leadership; starting controllers".green());
                let token = shutdown.child_token();
                let handles = vec![
                    tokio::spawn(GroupScheduler::new(runner_ctx.clone()).run(token.clone())),
                    tokio::spawn(podsync::run(k8s.clone(), filter.clone(), token.clone())),
                    tokio::spawn(forcedrain::run(
                        k8s.clone(),
                        drainer.clone(),
                        unrecoverable.clone(),
                        token.clone(),
                    )),
                    tokio::spawn({
                        let buffer = buffer.clone();
                        let token = token.clone();
                        async move { buffer.run(token).await }
                    }),
                ];
                components = Some((token, handles));
            }
        } else if let Some((token, handles)) = components.take() {
            // We are NOT leader; ensure the controllers are stopped.
            eprintln!("lost leadership; stopping controllers");
            token.cancel();
            for handle in handles {
                handle.await.ok();
            }
        }
    }
    Ok(())
}

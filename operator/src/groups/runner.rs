use crate::drain::Drainer;
use crate::drainbuffer::DrainBuffer;
use crate::kubernetes::client::ThrottledClient;
use crate::kubernetes::taints::{DrainState, is_drain_candidate, taint_node, untaint_node};
use crate::kubernetes::{GroupKeyFunc, index};
use crate::preprocess::{NotDoneReason, PreProcessResult, PreProcessor};
use crate::retrywall::RetryWall;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a runner needs; cloned into each spawned runner task.
#[derive(Clone)]
pub struct RunnerContext {
    pub k8s: ThrottledClient,
    pub group: GroupKeyFunc,
    pub preprocessors: Arc<Vec<Box<dyn PreProcessor>>>,
    pub drainer: Arc<dyn Drainer>,
    pub buffer: DrainBuffer,
    pub retry_wall: RetryWall,
    /// Cooldown recorded into the buffer after every successful drain.
    pub drain_buffer_duration: Duration,
    pub run_every: Duration,
}

/// What one full pass over the group's candidates concluded.
enum TickOutcome {
    Empty,
    Processed,
}

/// The verdict of running the whole pre-processor chain once.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChainVerdict {
    AllDone,
    Blocked,
    Failed(String),
}

/// Folds per-processor outcomes: any failure or timeout fails the candidate
/// (failures win over timeouts), anything else still outstanding blocks it.
pub(crate) fn chain_verdict(outcomes: &[(&str, PreProcessResult)]) -> ChainVerdict {
    let mut blocked = false;
    let mut failure: Option<String> = None;
    let mut timeout: Option<String> = None;
    for (name, outcome) in outcomes {
        match outcome {
            PreProcessResult::Done => {}
            PreProcessResult::NotDone(reason) => match reason {
                NotDoneReason::Failure => {
                    failure.get_or_insert_with(|| format!("pre-processor '{}' reported failure", name));
                }
                NotDoneReason::Timeout => {
                    timeout.get_or_insert_with(|| format!("pre-processor '{}' reported timeout", name));
                }
                NotDoneReason::Processing | NotDoneReason::NotCandidate => blocked = true,
            },
        }
    }
    if let Some(reason) = failure.or(timeout) {
        return ChainVerdict::Failed(reason);
    }
    if blocked {
        return ChainVerdict::Blocked;
    }
    ChainVerdict::AllDone
}

/// Drives every candidate of one group through the drain state machine.
/// Candidates are processed sequentially to keep disruption ordered within
/// the group.
pub struct DrainRunner {
    ctx: RunnerContext,
    group_key: String,
}

impl DrainRunner {
    pub fn new(ctx: RunnerContext, group_key: String) -> Self {
        Self { ctx, group_key }
    }

    pub async fn run(self, token: CancellationToken) {
        println!(
            "{}{}",
            "⚙️ Starting drain runner • group=".green(),
            self.group_key.cyan(),
        );
        let mut tick = tokio::time::interval(self.ctx.run_every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.tick_once(&token).await {
                Ok(TickOutcome::Empty) => {
                    println!(
                        "{}{}",
                        "💤 No candidates left • group=".dimmed(),
                        self.group_key.cyan(),
                    );
                    token.cancel();
                    break;
                }
                Ok(TickOutcome::Processed) => {}
                Err(e) => {
                    // Transient; the next tick retries from a fresh listing.
                    eprintln!(
                        "{}",
                        format!("⚠️ drain runner tick failed for group '{}': {}", self.group_key, e)
                            .yellow()
                    );
                }
            }
        }
        println!(
            "{}{}",
            "🛑 Drain runner stopped • group=".red(),
            self.group_key.cyan(),
        );
    }

    async fn tick_once(&self, token: &CancellationToken) -> Result<TickOutcome, crate::util::Error> {
        let nodes = index::nodes_in_group(&self.ctx.k8s, &self.ctx.group, &self.group_key).await?;
        let candidates: Vec<Node> = nodes.into_iter().filter(is_drain_candidate).collect();
        if candidates.is_empty() {
            return Ok(TickOutcome::Empty);
        }
        for node in &candidates {
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = self.process_candidate(node, token).await {
                eprintln!(
                    "{}",
                    format!(
                        "⚠️ candidate '{}' failed this tick (continuing): {}",
                        node.name_any(),
                        e
                    )
                    .yellow()
                );
            }
        }
        Ok(TickOutcome::Processed)
    }

    async fn process_candidate(
        &self,
        node: &Node,
        token: &CancellationToken,
    ) -> Result<(), crate::util::Error> {
        let now = Utc::now();
        let next_attempt = self.ctx.retry_wall.next_allowed_attempt(node)?;
        if next_attempt > now {
            println!(
                "{}",
                format!(
                    "⏸️ node '{}' is behind its retry wall until {}",
                    node.name_any(),
                    next_attempt
                )
                .dimmed()
            );
            return Ok(());
        }
        let next_drain = self.ctx.buffer.next_drain(&self.group_key).await?;
        if next_drain > now {
            println!(
                "{}",
                format!(
                    "⏸️ group '{}' is cooling down until {}",
                    self.group_key, next_drain
                )
                .dimmed()
            );
            return Ok(());
        }

        let mut outcomes: Vec<(&str, PreProcessResult)> = Vec::new();
        for preprocessor in self.ctx.preprocessors.iter() {
            match preprocessor.is_done(node).await {
                Ok(outcome) => outcomes.push((preprocessor.name(), outcome)),
                Err(e) => {
                    // Transient; treated as not done for this tick.
                    eprintln!(
                        "{}",
                        format!(
                            "⚠️ pre-processor '{}' errored on '{}': {}",
                            preprocessor.name(),
                            node.name_any(),
                            e
                        )
                        .yellow()
                    );
                    outcomes.push((
                        preprocessor.name(),
                        PreProcessResult::NotDone(NotDoneReason::Processing),
                    ));
                }
            }
        }
        match chain_verdict(&outcomes) {
            ChainVerdict::Blocked => Ok(()),
            ChainVerdict::Failed(reason) => self.fail_candidate(node, reason).await,
            ChainVerdict::AllDone => self.drain_candidate(node, token).await,
        }
    }

    /// The success path: candidate → draining → drained, then record the
    /// group cooldown and clear the retry wall.
    async fn drain_candidate(
        &self,
        node: &Node,
        token: &CancellationToken,
    ) -> Result<(), crate::util::Error> {
        let node = taint_node(
            self.ctx.k8s.acquire().await,
            node,
            DrainState::Draining,
            Timestamp::now(),
        )
        .await?;
        println!(
            "🔧 {}{}{}",
            node.name_any().magenta(),
            " DRAINING • group=".dimmed(),
            self.group_key.cyan(),
        );
        match self.ctx.drainer.drain(&node, token).await {
            Ok(()) => {
                let node = taint_node(
                    self.ctx.k8s.acquire().await,
                    &node,
                    DrainState::Drained,
                    Timestamp::now(),
                )
                .await?;
                self.ctx
                    .buffer
                    .store_successful_drain(&self.group_key, self.ctx.drain_buffer_duration)
                    .await?;
                self.ctx
                    .retry_wall
                    .reset(self.ctx.k8s.acquire().await, &node)
                    .await?;
                println!(
                    "{}",
                    format!("✅ node '{}' drained", node.name_any()).green()
                );
                Ok(())
            }
            Err(e) => {
                if token.is_cancelled() {
                    // Shutting down mid-drain is not a drain failure; leave
                    // the taint in place for the next leader to pick up.
                    return Ok(());
                }
                self.fail_candidate(&node, format!("drain failed: {}", e))
                    .await
            }
        }
    }

    /// The failure path: reset the pre-processors, raise the retry wall, and
    /// hand the node back to the detector by removing the taint.
    async fn fail_candidate(&self, node: &Node, reason: String) -> Result<(), crate::util::Error> {
        eprintln!(
            "{}",
            format!("❌ node '{}' failed to drain: {}", node.name_any(), reason).red()
        );
        for preprocessor in self.ctx.preprocessors.iter() {
            if let Err(e) = preprocessor.reset(node).await {
                eprintln!(
                    "{}",
                    format!(
                        "⚠️ reset of pre-processor '{}' failed on '{}': {}",
                        preprocessor.name(),
                        node.name_any(),
                        e
                    )
                    .yellow()
                );
            }
        }
        let node = self
            .ctx
            .retry_wall
            .set_new_retry_wall_timestamp(self.ctx.k8s.acquire().await, node, &reason, Utc::now())
            .await?;
        untaint_node(self.ctx.k8s.acquire().await, &node).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done() -> PreProcessResult {
        PreProcessResult::Done
    }

    fn not_done(reason: NotDoneReason) -> PreProcessResult {
        PreProcessResult::NotDone(reason)
    }

    #[test]
    fn all_done_unlocks_the_drain() {
        let outcomes = [("a", done()), ("b", done())];
        assert_eq!(chain_verdict(&outcomes), ChainVerdict::AllDone);
    }

    #[test]
    fn a_single_processing_gate_blocks() {
        let outcomes = [
            ("a", done()),
            ("b", not_done(NotDoneReason::Processing)),
            ("c", done()),
        ];
        assert_eq!(chain_verdict(&outcomes), ChainVerdict::Blocked);
    }

    #[test]
    fn timeout_fails_the_candidate_with_a_telling_reason() {
        let outcomes = [
            ("node-replacement", not_done(NotDoneReason::Timeout)),
            ("wait-time", done()),
        ];
        match chain_verdict(&outcomes) {
            ChainVerdict::Failed(reason) => assert!(reason.contains("timeout")),
            verdict => panic!("unexpected verdict: {:?}", verdict),
        }
    }

    #[test]
    fn failure_wins_over_timeout() {
        let outcomes = [
            ("a", not_done(NotDoneReason::Timeout)),
            ("b", not_done(NotDoneReason::Failure)),
        ];
        match chain_verdict(&outcomes) {
            ChainVerdict::Failed(reason) => {
                assert!(reason.contains("failure"));
                assert!(reason.contains("'b'"));
            }
            verdict => panic!("unexpected verdict: {:?}", verdict),
        }
    }

    #[test]
    fn empty_chain_is_trivially_done() {
        assert_eq!(chain_verdict(&[]), ChainVerdict::AllDone);
    }
}

use clap::Parser;
use std::time::Duration;

fn duration_value(s: &str) -> Result<Duration, String> {
    parse_duration::parse(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug, Clone)]
pub struct DrainArgs {
    /// How often each group runner re-evaluates its candidates
    #[arg(long, env = "RUN_EVERY", default_value = "30s", value_parser = duration_value)]
    pub run_every: Duration,

    /// Cooldown between two successful drains within one group
    #[arg(long, env = "DRAIN_BUFFER", default_value = "10m", value_parser = duration_value)]
    pub drain_buffer: Duration,

    /// Minimum age of a drain candidate before it may be drained
    #[arg(long, env = "MIN_WAIT", default_value = "0s", value_parser = duration_value)]
    pub min_wait: Duration,

    /// Node label whose value assigns candidates to a drain group
    #[arg(
        long,
        env = "GROUP_KEY_LABEL",
        default_value = "node-lifecycle.datadoghq.com/group"
    )]
    pub group_key_label: String,

    /// Upper bound on concurrent pod evictions during one drain
    #[arg(long, env = "MAX_CONCURRENT_EVICTIONS", default_value_t = 5)]
    pub max_concurrent_evictions: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct ReplacementArgs {
    /// Request a pre-drain replacement for every candidate unless the node opts out
    #[arg(long, env = "REPLACE_NODES_BY_DEFAULT", default_value_t = false)]
    pub replace_by_default: bool,

    /// How long a requested replacement may stay pending before the candidate fails
    #[arg(long, env = "REPLACEMENT_TIMEOUT", default_value = "1h", value_parser = duration_value)]
    pub replacement_timeout: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct PreActivityArgs {
    /// Timeout applied to pre-activities that do not declare their own
    #[arg(
        long,
        env = "DEFAULT_PRE_ACTIVITY_TIMEOUT",
        default_value = "10m",
        value_parser = duration_value
    )]
    pub default_pre_activity_timeout: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct RetryWallArgs {
    /// First back-off step after a failed drain; doubles on every further failure
    #[arg(long, env = "RETRY_BACKOFF_BASE", default_value = "1m", value_parser = duration_value)]
    pub retry_backoff_base: Duration,

    /// Ceiling on the drain retry back-off
    #[arg(long, env = "RETRY_BACKOFF_CEILING", default_value = "6h", value_parser = duration_value)]
    pub retry_backoff_ceiling: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct PersistorArgs {
    /// Name of the ConfigMap holding the persisted drain-buffer cache
    #[arg(
        long,
        env = "DRAIN_BUFFER_CONFIGMAP",
        default_value = "node-lifecycle-drain-buffer"
    )]
    pub drain_buffer_configmap: String,

    /// Namespace for the persistor ConfigMap and the leader-election lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,
}

#[derive(Parser, Debug, Clone)]
pub struct RateLimiterArgs {
    /// Sustained apiserver request rate in tokens per second
    #[arg(long, env = "CLIENT_QPS", default_value_t = 10.0)]
    pub client_qps: f64,

    /// Burst capacity of the apiserver client token bucket
    #[arg(long, env = "CLIENT_BURST", default_value_t = 20)]
    pub client_burst: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct ForceDrainArgs {
    /// Node condition treated as unrecoverable, as "TYPE" or "TYPE:force";
    /// only ":force" entries make the node eligible for forced eviction
    #[arg(
        long = "unrecoverable-condition",
        env = "UNRECOVERABLE_CONDITIONS",
        value_delimiter = ','
    )]
    pub unrecoverable_conditions: Vec<String>,
}

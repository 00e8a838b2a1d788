#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Failed to sync the condition on {failed} of {total} pods: {errors:?}")]
    PodSync {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    #[error("Failed to drain node '{node}': {failures:?}")]
    Drain { node: String, failures: Vec<String> },

    #[error("Gave up evicting pod '{0}' after repeated disruption-budget rejections")]
    EvictionStalled(String),

    #[error("Operation cancelled")]
    Cancelled,
}

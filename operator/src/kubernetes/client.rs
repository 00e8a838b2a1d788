use kube::Client;
use node_lifecycle_common::rate_limit::RateLimiter;

/// Kubernetes client routed through the token-bucket limiter. Every
/// request-scoped call acquires a token first; long-lived watch streams use
/// [`ThrottledClient::raw`].
#[derive(Clone)]
pub struct ThrottledClient {
    name: &'static str,
    client: Client,
    limiter: RateLimiter,
}

impl ThrottledClient {
    pub fn new(name: &'static str, client: Client, limiter: RateLimiter) -> Self {
        Self {
            name,
            client,
            limiter,
        }
    }

    /// Waits for a token, then hands out the underlying client for one call.
    pub async fn acquire(&self) -> Client {
        let remaining = self.limiter.acquire().await;
        #[cfg(feature = "metrics")]
        crate::util::metrics::set_client_tokens_remaining(self.name, remaining);
        #[cfg(not(feature = "metrics"))]
        let _ = remaining;
        self.client.clone()
    }

    /// The unthrottled client, for constructing watch streams.
    pub fn raw(&self) -> Client {
        self.client.clone()
    }
}

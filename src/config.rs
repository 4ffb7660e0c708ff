use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the Carbon server, without a trailing slash.
    pub base_url: String,
    /// Timeout applied to every REST request. The push channel is exempt.
    pub request_timeout: Duration,
    /// Upper bound for the reconnect backoff delay.
    pub reconnect_max_delay: Duration,
    /// Whether the engine reconnects the push channel after a stream drop.
    pub auto_reconnect: bool,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(30),
            auto_reconnect: true,
        }
    }
}

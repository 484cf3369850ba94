use std::time::Duration;
use tokio::runtime::Handle;

const DEFAULT_USER_AGENT: &str = concat!("fanout/", env!("CARGO_PKG_VERSION"));

/// Timeout applied to a request that does not specify its own
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Fan-out configuration. Applies to every request of a batch unless a request overrides it.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// User agent string for requests sent through the default client
    pub user_agent: String,
    /// Timeout for requests that don't carry their own
    pub default_timeout: Duration,
    /// Disable Nagle's algorithm on TCP sockets of the default client
    pub tcp_nodelay: bool,
    /// Honour HTTP(S)_PROXY environment variables in the default client
    pub system_proxy: bool,
    /// Runtime to spawn requests on. Uses the current runtime when not set.
    pub runtime: Option<Handle>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            tcp_nodelay: true,
            system_proxy: false,
            runtime: None,
        }
    }
}

impl FanoutConfig {
    /// Builds the client used by requests that don't bring their own connection-reuse handle.
    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .tcp_nodelay(self.tcp_nodelay);

        if self.system_proxy {
            builder
        } else {
            builder.no_proxy()
        }
    }
}

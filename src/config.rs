//! Configuration for a [crate::client::Client].

use crate::policy::Policy;

use tokio::time::Duration;

/// How long a tracker or storage exchange may take, by default.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Describes which trackers a client talks to, and how its pools behave.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Tracker addresses, as `host:port`. Host names are resolved when the
    /// client is created.
    pub endpoints: Vec<String>,

    /// Bounds each request/response exchange, and each wait for a pooled
    /// connection.
    pub network_timeout: Duration,

    /// Policy for the pool of tracker connections.
    pub tracker_policy: Policy,

    /// Policy for every storage pool.
    pub storage_policy: Policy,
}

impl ClientConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let timeout = DEFAULT_NETWORK_TIMEOUT;
        let policy = Policy {
            claim_timeout: timeout,
            ..Default::default()
        };
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            network_timeout: timeout,
            tracker_policy: policy.clone(),
            storage_policy: policy,
        }
    }

    /// Sets the network timeout, which also bounds claims in both pools.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self.tracker_policy.claim_timeout = timeout;
        self.storage_policy.claim_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.tracker_policy.connect_timeout = timeout;
        self.storage_policy.connect_timeout = timeout;
        self
    }

    /// Sets how many connections each pool opens when it is created.
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.tracker_policy.min_connections = min;
        self.storage_policy.min_connections = min;
        self
    }

    /// Sets the most connections each pool may hold.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.tracker_policy.max_connections = max;
        self.storage_policy.max_connections = max;
        self
    }

    /// Checks the settings which can be checked without any I/O.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("at least one tracker endpoint is required".to_string());
        }
        for (name, policy) in [
            ("tracker", &self.tracker_policy),
            ("storage", &self.storage_policy),
        ] {
            if policy.max_connections == 0 {
                return Err(format!("{name} pool needs a non-zero max_connections"));
            }
            if policy.min_connections > policy.max_connections {
                return Err(format!(
                    "{name} pool min_connections ({}) exceeds max_connections ({})",
                    policy.min_connections, policy.max_connections
                ));
            }
        }
        Ok(())
    }
}

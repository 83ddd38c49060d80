//! Configuration options which can alter the behavior of the pool.

use tokio::time::Duration;

/// Policy which is applicable to a connection pool.
///
/// A single policy is chosen when a pool (or the registry which creates
/// storage pools) is constructed; it is never varied per request.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Policy {
    /// The number of connections opened eagerly when the pool is created.
    pub min_connections: usize,

    /// The maximum number of connections which can be open (or opening)
    /// within this pool at once.
    pub max_connections: usize,

    /// How long a claim may wait for a connection before failing.
    pub claim_timeout: Duration,

    /// How long a single connection attempt may take.
    pub connect_timeout: Duration,

    /// Idle connections older than this are checked with
    /// [crate::backend::Connector::is_valid] before being claimed.
    pub validate_idle_after: Duration,

    /// How long a health check may take before the connection is discarded.
    pub health_check_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_connections: 10,
            max_connections: 150,
            claim_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            validate_idle_after: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoordError;
use crate::namespace::{Namespace, validate_segment};
use crate::retry::Backoff;

/// Coordinator configuration
///
/// Everything here is fixed once a [`super::Coordinator`] is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node identity, used as the claim owner and command inbox name
    #[serde(rename = "node-id", default = "default_node_id")]
    pub node_id: String,

    /// Namespace root shared by every node of one cluster
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Claim TTL in milliseconds
    #[serde(rename = "claim-ttl-ms", default = "default_claim_ttl_ms")]
    pub claim_ttl_ms: u64,

    /// Lease renewal interval in milliseconds (defaults to half the TTL)
    #[serde(rename = "renew-interval-ms", default, skip_serializing_if = "Option::is_none")]
    pub renew_interval_ms: Option<u64>,

    /// Buffer size for the candidate and command channels
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Retry policy for transient store failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Upper bound on how long close() spends releasing claims
    #[serde(rename = "shutdown-grace-ms", default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_node_id() -> String {
    debug!("default_node_id: called");
    format!("node-{}", Uuid::now_v7())
}

fn default_namespace() -> String {
    debug!("default_namespace: called");
    "/taskcoord/".to_string()
}

fn default_claim_ttl_ms() -> u64 {
    debug!("default_claim_ttl_ms: called");
    30_000
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    64
}

fn default_shutdown_grace_ms() -> u64 {
    debug!("default_shutdown_grace_ms: called");
    5_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            node_id: default_node_id(),
            namespace: default_namespace(),
            claim_ttl_ms: 30_000,
            renew_interval_ms: None,
            channel_buffer: 64,
            retry: RetryConfig::default(),
            shutdown_grace_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config for a node in a namespace, other settings at defaults
    pub fn new(node_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Claim TTL as a Duration
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    /// Renewal interval as a Duration
    pub fn renew_interval(&self) -> Duration {
        let ms = self.renew_interval_ms.unwrap_or(self.claim_ttl_ms / 2).max(1);
        Duration::from_millis(ms)
    }

    /// Shutdown grace period as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse the namespace root
    pub fn parsed_namespace(&self) -> Result<Namespace, CoordError> {
        Namespace::new(&self.namespace)
    }

    /// Check the config is usable before any store traffic happens
    pub fn validate(&self) -> Result<(), CoordError> {
        debug!(node_id = %self.node_id, namespace = %self.namespace, "CoordinatorConfig::validate: called");
        validate_segment("node id", &self.node_id)?;
        self.parsed_namespace()?;

        if self.claim_ttl_ms == 0 {
            return Err(CoordError::InvalidConfig("claim-ttl-ms must be positive".to_string()));
        }
        if self.renew_interval() >= self.claim_ttl() {
            return Err(CoordError::InvalidConfig(format!(
                "renew-interval-ms ({}) must be less than claim-ttl-ms ({})",
                self.renew_interval().as_millis(),
                self.claim_ttl_ms
            )));
        }
        if self.channel_buffer == 0 {
            return Err(CoordError::InvalidConfig("channel-buffer must be positive".to_string()));
        }
        self.retry.validate()
    }
}

/// Retry policy for transient store failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds
    #[serde(rename = "initial-backoff-ms", default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(rename = "max-backoff-ms", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Consecutive failures tolerated before escalating to the caller
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            max_attempts: 10,
        }
    }
}

impl RetryConfig {
    /// Fresh backoff state for one retry sequence
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.max_attempts,
        )
    }

    fn validate(&self) -> Result<(), CoordError> {
        if self.max_attempts == 0 {
            return Err(CoordError::InvalidConfig("retry.max-attempts must be positive".to_string()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(CoordError::InvalidConfig(
                "retry.initial-backoff-ms exceeds retry.max-backoff-ms".to_string(),
            ));
        }
        Ok(())
    }
}

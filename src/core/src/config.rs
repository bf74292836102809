//! Client tuning configuration.
//!
//! Shared knobs for outbound HTTP and blob transfer. Every field has a
//! conservative default; callers override selectively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default request timeout. Blob transfers of multi-hundred-megabyte
/// layers over slow links need generous room.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle connections kept per host.
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 4;

/// Default number of concurrent blob uploads during a save.
const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// Tuning configuration for registry clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request deadline, including body transfer.
    pub request_timeout: Duration,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Idle connections kept per host in the pool.
    pub pool_max_idle_per_host: usize,
    /// Bound on concurrent blob uploads during a save.
    pub upload_concurrency: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }
}

impl ClientConfig {
    /// Returns the upload concurrency, clamped to at least one worker.
    pub fn upload_concurrency(&self) -> usize {
        self.upload_concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.upload_concurrency(), 4);
    }

    #[test]
    fn test_upload_concurrency_clamped() {
        let config = ClientConfig {
            upload_concurrency: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.upload_concurrency(), 1);
    }
}

//! Configuration record (distilled spec §6).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one named `DispatcherQueue`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded FIFO capacity.
    pub size: usize,
    /// Number of worker threads draining the queue.
    pub threads: usize,
}

/// Whether the live `CommTask` set uses a spinlock or a mutex (distilled
/// §9, "spin-vs-mutex build flag" is moved from a compile-time toggle to
/// a runtime one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// `std::sync::Mutex`; favors throughput under contention.
    Mutex,
    /// A busy-wait spinlock; favors latency when hold times are short.
    Spin,
}

impl Default for LockStrategy {
    fn default() -> Self {
        LockStrategy::Mutex
    }
}

/// One TCP listen endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenEndpoint {
    /// Address and port to bind.
    pub address: SocketAddr,
    /// Whether this endpoint terminates TLS.
    #[serde(default)]
    pub encrypted: bool,
}

/// The full set of recognized options (distilled spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Seconds of inactivity before an idle keep-alive connection closes.
    /// `0` closes the connection after the first response (distilled §8
    /// boundary behavior).
    pub keep_alive_timeout_secs: u64,
    /// Named dispatcher queues, selected by `Handler::queue()`.
    pub dispatcher_queues: BTreeMap<String, QueueConfig>,
    /// Maximum number of simultaneously streaming chunked tasks.
    pub max_chunked_tasks: usize,
    /// Time-to-live for async job entries before the background sweep
    /// drops them.
    pub async_job_ttl_secs: u64,
    /// Maximum number of entries `AsyncJobManager` retains at once.
    pub async_job_capacity: usize,
    /// Whether handlers may declare themselves for direct (inline,
    /// event-loop-thread) execution.
    pub direct_execution_allowed: bool,
    /// Listen endpoints.
    pub listen: Vec<ListenEndpoint>,
    /// Number of event-loop threads.
    pub event_loops: usize,
    /// Live-`CommTask`-set locking strategy.
    pub comm_task_lock: LockStrategy,
}

impl ServerConfig {
    /// `keep_alive_timeout_secs` as a [`Duration`].
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    /// `async_job_ttl_secs` as a [`Duration`].
    pub fn async_job_ttl(&self) -> Duration {
        Duration::from_secs(self.async_job_ttl_secs)
    }

    /// Parses a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut dispatcher_queues = BTreeMap::new();
        dispatcher_queues.insert(
            "standard".to_string(),
            QueueConfig {
                size: 256,
                threads: 4,
            },
        );

        ServerConfig {
            keep_alive_timeout_secs: 300,
            dispatcher_queues,
            max_chunked_tasks: 64,
            async_job_ttl_secs: 3600,
            async_job_capacity: 1024,
            direct_execution_allowed: true,
            listen: vec![ListenEndpoint {
                address: "127.0.0.1:8529".parse().unwrap(),
                encrypted: false,
            }],
            event_loops: 2,
            comm_task_lock: LockStrategy::Mutex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_distilled_spec() {
        let cfg = ServerConfig::default();
        assert_eq!(300, cfg.keep_alive_timeout_secs);
        assert!(cfg.direct_execution_allowed);
        assert_eq!(1, cfg.listen.len());
    }

    #[test]
    fn keep_alive_zero_parses() {
        let toml_text = r#"
            keep_alive_timeout_secs = 0
            max_chunked_tasks = 8
            async_job_ttl_secs = 60
            async_job_capacity = 10
            direct_execution_allowed = false
            event_loops = 1
            comm_task_lock = "spin"

            [[listen]]
            address = "0.0.0.0:8080"
            encrypted = false

            [dispatcher_queues.standard]
            size = 16
            threads = 2
        "#;

        let cfg = ServerConfig::from_toml(toml_text).unwrap();
        assert_eq!(Duration::from_secs(0), cfg.keep_alive_timeout());
        assert_eq!(LockStrategy::Spin, cfg.comm_task_lock);
        assert!(!cfg.direct_execution_allowed);
    }
}

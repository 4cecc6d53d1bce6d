//! Configuration for the link stack and the failure detector.
//!
//! Every component receives its configuration at construction; nothing is
//! read from process-wide state. Durations are stored as integer
//! milliseconds so the JSON form stays simple, with `Duration` accessors.

use crate::address::DEFAULT_SERVICE_PORT;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for the whole stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Local address the Fair-Loss Link listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default)]
    pub fair_loss: FairLossConfig,

    #[serde(default)]
    pub stubborn: StubbornConfig,

    #[serde(default)]
    pub perfect: PerfectConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SERVICE_PORT))
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            fair_loss: FairLossConfig::default(),
            stubborn: StubbornConfig::default(),
            perfect: PerfectConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: LinkConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!("Loaded link configuration from {}", path.display());
        Ok(config)
    }
}

/// Fair-Loss Link transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairLossConfig {
    /// Inbound connections read at once; further ones are closed unread
    /// (default: 256)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Concurrent workers opening outbound connections, per queue (default: 1)
    #[serde(default = "default_workers")]
    pub send_workers: usize,

    /// Frames queued per outbound queue. A full fresh-send queue drops new
    /// frames; retransmissions wait for room instead (default: 1024)
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Upper bound on establishing an outbound connection (default: 2s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on reading one inbound frame, 0 = wait forever (default: 30s)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Pause before reopening the listener after an accept error (default: 1s)
    #[serde(default = "default_rebind_delay")]
    pub rebind_delay_ms: u64,

    /// Log every send and delivery at info level
    #[serde(default)]
    pub log_traffic: bool,
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    256
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    2_000
}

fn default_read_timeout() -> u64 {
    30_000
}

fn default_rebind_delay() -> u64 {
    1_000
}

impl Default for FairLossConfig {
    fn default() -> Self {
        Self::minimal()
    }
}

impl FairLossConfig {
    /// One accept worker and one send worker per outbound queue.
    pub fn minimal() -> Self {
        Self {
            max_connections: default_max_connections(),
            send_workers: default_workers(),
            outbound_queue: default_outbound_queue(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            rebind_delay_ms: default_rebind_delay(),
            log_traffic: false,
        }
    }

    /// `workers` concurrent send workers per outbound queue.
    pub fn scaled(workers: usize) -> Self {
        Self {
            send_workers: workers.max(1),
            ..Self::minimal()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }
}

/// Stubborn Link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubbornConfig {
    /// How often every pending message is sent again (default: 30s)
    #[serde(default = "default_retransmit_interval")]
    pub retransmit_interval_ms: u64,

    /// Log every send and delivery at info level
    #[serde(default)]
    pub log_traffic: bool,
}

fn default_retransmit_interval() -> u64 {
    30_000
}

impl Default for StubbornConfig {
    fn default() -> Self {
        Self {
            retransmit_interval_ms: default_retransmit_interval(),
            log_traffic: false,
        }
    }
}

impl StubbornConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }
}

/// Perfect Link settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfectConfig {
    /// How often the retention hook is applied to the delivered set.
    /// None (the default) never prunes, which keeps delivery exactly-once.
    #[serde(default)]
    pub prune_interval_ms: Option<u64>,

    /// Log every send and delivery at info level
    #[serde(default)]
    pub log_traffic: bool,
}

impl PerfectConfig {
    pub fn prune_interval(&self) -> Option<Duration> {
        self.prune_interval_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }
}

/// Perfect Failure Detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Time between sweeps. Must exceed the worst-case round trip through
    /// the Perfect Link, otherwise live processes get suspected (default: 5s)
    #[serde(default = "default_period")]
    pub period_ms: u64,

    /// Log heartbeats and sweeps at info level
    #[serde(default)]
    pub log_traffic: bool,
}

fn default_period() -> u64 {
    5_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period(),
            log_traffic: false,
        }
    }
}

impl DetectorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

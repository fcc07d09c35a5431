//! Verbs substrate configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use triport_net::{Error, ProtocolConfig, Result, DEFAULT_EAGER_THRESHOLD};
use triport_softnic::DeviceAttr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbsConfig {
    /// Requested send queue depth, capped by the device.
    #[serde(default = "default_queue_depth")]
    pub max_send_wr: usize,

    /// Requested receive queue depth, capped by the device.
    #[serde(default = "default_queue_depth")]
    pub max_recv_wr: usize,

    /// Scatter-gather entries per work request, capped by the device.
    #[serde(default = "default_max_sge")]
    pub max_sge: usize,

    /// Sends up to this many bytes are posted inline.
    #[serde(default = "default_max_inline_data")]
    pub max_inline_data: usize,

    #[serde(default = "default_eager_threshold")]
    pub eager_threshold: usize,

    /// Bytes per rendezvous body work request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Upper bound on one completion wait; 0 waits forever.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Upper bound on a blocking connect; 0 waits forever.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: usize,

    /// The emulated HCA.
    #[serde(default)]
    pub device: DeviceAttr,
}

fn default_queue_depth() -> usize {
    128
}
fn default_max_sge() -> usize {
    16
}
fn default_max_inline_data() -> usize {
    64
}
fn default_eager_threshold() -> usize {
    DEFAULT_EAGER_THRESHOLD
}
fn default_chunk_size() -> usize {
    1 << 20
}
fn default_completion_timeout_ms() -> u64 {
    60_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_listen_backlog() -> usize {
    1024
}

impl Default for VerbsConfig {
    fn default() -> Self {
        Self {
            max_send_wr: default_queue_depth(),
            max_recv_wr: default_queue_depth(),
            max_sge: default_max_sge(),
            max_inline_data: default_max_inline_data(),
            eager_threshold: default_eager_threshold(),
            chunk_size: default_chunk_size(),
            completion_timeout_ms: default_completion_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            listen_backlog: default_listen_backlog(),
            device: DeviceAttr::default(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl VerbsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eager_threshold == 0 {
            return Err(Error::InvalidArgument("eager_threshold must be positive".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > self.device.max_msg_sz {
            return Err(Error::InvalidArgument(format!(
                "chunk_size {} outside 1..={}",
                self.chunk_size, self.device.max_msg_sz
            )));
        }
        // Two eager receives plus at least one body receive.
        if self.max_recv_wr < 3 {
            return Err(Error::InvalidArgument(format!(
                "max_recv_wr {} must be at least 3",
                self.max_recv_wr
            )));
        }
        if self.max_send_wr < 2 {
            return Err(Error::InvalidArgument(format!(
                "max_send_wr {} must be at least 2",
                self.max_send_wr
            )));
        }
        if self.max_sge == 0 {
            return Err(Error::InvalidArgument("max_sge must be positive".into()));
        }
        Ok(())
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        millis(self.completion_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            eager_threshold: self.eager_threshold,
            chunk_size: self.chunk_size,
            completion_timeout: self.completion_timeout(),
        }
    }
}

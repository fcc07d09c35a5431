//! Fabric substrate configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use triport_net::{Error, ProtocolConfig, Result, DEFAULT_EAGER_THRESHOLD};
use triport_softnic::FabricAttr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Outstanding sends per channel, capped by the provider's tx size.
    #[serde(default = "default_queue_depth")]
    pub max_send_wr: usize,

    /// Posted receives per channel, capped by the provider's rx size.
    #[serde(default = "default_queue_depth")]
    pub max_recv_wr: usize,

    /// Scatter-gather entries per message, capped by the provider.
    #[serde(default = "default_iov_limit")]
    pub iov_limit: usize,

    /// Scatter-gather entries per one-sided operation, capped by the provider.
    #[serde(default = "default_iov_limit")]
    pub rma_iov_limit: usize,

    #[serde(default = "default_eager_threshold")]
    pub eager_threshold: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Upper bound on one completion wait; 0 waits forever.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Upper bound on a blocking connect; 0 waits forever.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// The emulated provider.
    #[serde(default)]
    pub attr: FabricAttr,
}

fn default_queue_depth() -> usize {
    128
}
fn default_iov_limit() -> usize {
    4
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

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_send_wr: default_queue_depth(),
            max_recv_wr: default_queue_depth(),
            iov_limit: default_iov_limit(),
            rma_iov_limit: default_iov_limit(),
            eager_threshold: default_eager_threshold(),
            chunk_size: default_chunk_size(),
            completion_timeout_ms: default_completion_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            attr: FabricAttr::default(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl FabricConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eager_threshold == 0 {
            return Err(Error::InvalidArgument("eager_threshold must be positive".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > self.attr.max_msg_size {
            return Err(Error::InvalidArgument(format!(
                "chunk_size {} outside 1..={}",
                self.chunk_size, self.attr.max_msg_size
            )));
        }
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
        if self.iov_limit == 0 || self.rma_iov_limit == 0 {
            return Err(Error::InvalidArgument("iov limits must be positive".into()));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = FabricConfig::default();
        config.validate().unwrap();
        assert_eq!(config.iov_limit, 4);
        assert_eq!(config.completion_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FabricConfig =
            serde_json::from_str(r#"{"chunk_size": 4096, "attr": {"inject_size": 0}}"#).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.attr.inject_size, 0);
        assert_eq!(config.attr.tx_size, FabricAttr::default().tx_size);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_validation_rules() {
        let zero_iov = FabricConfig {
            rma_iov_limit: 0,
            ..FabricConfig::default()
        };
        assert!(zero_iov.validate().is_err());

        let tiny_provider = FabricConfig {
            attr: FabricAttr {
                max_msg_size: 1024,
                ..FabricAttr::default()
            },
            ..FabricConfig::default()
        };
        assert!(tiny_provider.validate().is_err());
    }
}

//! Socket substrate configuration.

use serde::{Deserialize, Serialize};
use socket2::SockRef;
use triport_net::{Error, Result};

/// Options applied to every stream and listener the substrate creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm.
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// SO_SNDBUF in bytes.
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,

    /// SO_RCVBUF in bytes.
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,

    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// SO_REUSEADDR on listeners.
    #[serde(default = "default_true")]
    pub reuse_addr: bool,

    /// Buffers a channel may have queued for non-blocking transfer.
    #[serde(default = "default_max_pending_iov")]
    pub max_pending_iov: usize,
}

fn default_true() -> bool {
    true
}
fn default_buffer_size() -> usize {
    2 * 1024 * 1024
}
fn default_listen_backlog() -> i32 {
    1024
}
fn default_max_pending_iov() -> usize {
    1024
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: default_true(),
            send_buffer_size: default_buffer_size(),
            recv_buffer_size: default_buffer_size(),
            listen_backlog: default_listen_backlog(),
            reuse_addr: default_true(),
            max_pending_iov: default_max_pending_iov(),
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_iov == 0 {
            return Err(Error::InvalidArgument("max_pending_iov must be positive".into()));
        }
        if self.listen_backlog <= 0 {
            return Err(Error::InvalidArgument(format!(
                "listen_backlog {} must be positive",
                self.listen_backlog
            )));
        }
        Ok(())
    }

    /// Apply the per-stream options.
    pub(crate) fn apply(&self, socket: SockRef<'_>) -> std::io::Result<()> {
        socket.set_nodelay(self.nodelay)?;
        socket.set_send_buffer_size(self.send_buffer_size)?;
        socket.set_recv_buffer_size(self.recv_buffer_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SocketConfig::default();
        assert!(config.nodelay);
        assert_eq!(config.send_buffer_size, 2 * 1024 * 1024);
        assert_eq!(config.listen_backlog, 1024);
        assert_eq!(config.max_pending_iov, 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SocketConfig = serde_json::from_str(r#"{"max_pending_iov": 4}"#).unwrap();
        assert_eq!(config.max_pending_iov, 4);
        assert!(config.reuse_addr);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = SocketConfig {
            max_pending_iov: 0,
            ..SocketConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

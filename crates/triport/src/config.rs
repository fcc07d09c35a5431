//! Transport configuration, loadable from TOML.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use triport_logging::{LogConfig, LogError};
use triport_net_fabric::FabricConfig;
use triport_net_tcp::SocketConfig;
use triport_net_verbs::VerbsConfig;
use triport_types::Provider;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [{section}] section: {reason}")]
    Invalid { section: &'static str, reason: String },

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Everything a [`Transport`](crate::Transport) needs. Only the section of
/// the selected provider is used, but every section is validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub provider: Provider,

    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub verbs: VerbsConfig,

    #[serde(default)]
    pub fabric: FabricConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn invalid(section: &'static str) -> impl Fn(triport_net::Error) -> ConfigError {
    move |e| ConfigError::Invalid {
        section,
        reason: e.to_string(),
    }
}

impl TransportConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = content.parse()?;
        tracing::debug!(path = %path.display(), provider = %config.provider, "loaded transport config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket.validate().map_err(invalid("socket"))?;
        self.verbs.validate().map_err(invalid("verbs"))?;
        self.fabric.validate().map_err(invalid("fabric"))?;
        self.log.build_filter()?;
        Ok(())
    }
}

impl FromStr for TransportConfig {
    type Err = ConfigError;

    /// Parse and validate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config: TransportConfig = "".parse().unwrap();
        assert_eq!(config.provider, Provider::Socket);
        assert_eq!(config.verbs, VerbsConfig::default());
        assert_eq!(config.socket.max_pending_iov, 1024);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: TransportConfig = r#"
            provider = "fabric"

            [fabric]
            eager_threshold = 4096
            chunk_size = 65536

            [fabric.attr]
            iov_limit = 8

            [verbs.device]
            max_sge = 2

            [log]
            level = "debug"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.provider, Provider::Fabric);
        assert_eq!(config.fabric.eager_threshold, 4096);
        assert_eq!(config.fabric.attr.iov_limit, 8);
        assert_eq!(config.verbs.device.max_sge, 2);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_validation_errors_name_the_section() {
        let err = "[verbs]\nmax_recv_wr = 2\n".parse::<TransportConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "verbs", .. }), "{err}");

        let err = "[fabric]\neager_threshold = 0\n".parse::<TransportConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "fabric", .. }));

        let err = "provider = \"carrier-pigeon\"\n".parse::<TransportConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider = \"verbs\"\n[verbs]\nchunk_size = 8192").unwrap();
        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.provider, Provider::Verbs);
        assert_eq!(config.verbs.chunk_size, 8192);

        let missing = file.path().with_extension("missing");
        assert!(matches!(TransportConfig::from_file(missing), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = TransportConfig {
            provider: Provider::Verbs,
            ..TransportConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"provider\":\"verbs\""));
        let back: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider, Provider::Verbs);
        assert_eq!(back.fabric, config.fabric);
    }
}

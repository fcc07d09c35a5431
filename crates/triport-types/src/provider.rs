//! Transport provider selector values.

use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// The network substrate a client, server or event loop is built on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Ordinary TCP stream sockets.
    Socket = 0,
    /// Reliable-connected verbs with an RDMA connection manager.
    Verbs = 1,
    /// Reliable-datagram fabric endpoints with tagged messaging.
    Fabric = 2,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Socket, Provider::Verbs, Provider::Fabric];

    /// Whether the provider can perform one-sided Write/Read.
    pub fn supports_rma(&self) -> bool {
        !matches!(self, Provider::Socket)
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Socket
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Socket => write!(f, "socket"),
            Provider::Verbs => write!(f, "verbs"),
            Provider::Fabric => write!(f, "fabric"),
        }
    }
}

/// Error returned when a provider name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socket" | "sock" | "tcp" => Ok(Provider::Socket),
            "verbs" | "rdma" | "ib" => Ok(Provider::Verbs),
            "fabric" | "ofi" | "libfabric" => Ok(Provider::Fabric),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_aliases() {
        assert_eq!("tcp".parse::<Provider>().unwrap(), Provider::Socket);
        assert_eq!("RDMA".parse::<Provider>().unwrap(), Provider::Verbs);
        assert_eq!("ofi".parse::<Provider>().unwrap(), Provider::Fabric);
        assert!("carrier-pigeon".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_display_roundtrip() {
        for provider in Provider::ALL {
            let parsed: Provider = provider.to_string().parse().unwrap();
            assert_eq!(parsed, provider);
        }
    }

    #[test]
    fn test_provider_primitive() {
        let raw: u16 = Provider::Fabric.into();
        assert_eq!(raw, 2);
        assert_eq!(Provider::try_from(1u16).unwrap(), Provider::Verbs);
        assert!(Provider::try_from(7u16).is_err());
    }

    #[test]
    fn test_provider_default_and_rma() {
        assert_eq!(Provider::default(), Provider::Socket);
        assert!(!Provider::Socket.supports_rma());
        assert!(Provider::Verbs.supports_rma());
    }

    #[test]
    fn test_provider_serde() {
        let json = serde_json::to_string(&Provider::Verbs).unwrap();
        assert_eq!(json, "\"verbs\"");
        let back: Provider = serde_json::from_str("\"fabric\"").unwrap();
        assert_eq!(back, Provider::Fabric);
    }
}

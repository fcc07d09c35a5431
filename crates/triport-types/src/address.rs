use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::provider::Provider;

/// Length in bytes of the raw form produced by [`Address::to_raw`].
pub const RAW_ADDR_LEN: usize = 8;

/// An IPv4 endpoint address tagged with the provider that owns it.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address in network byte order (big-endian).
    pub ip: u32,
    pub port: u16,
    pub provider: Provider,
}

impl Address {
    pub fn new(ip: u32, port: u16, provider: Provider) -> Self {
        Self { ip, port, provider }
    }

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16, provider: Provider) -> Self {
        Self::new(u32::from_be_bytes([a, b, c, d]), port, provider)
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip == 0
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    /// Whether a listener bound at `self` accepts traffic addressed to `dest`.
    pub fn accepts(&self, dest: &Address) -> bool {
        self.port == dest.port && (self.is_unspecified() || self.ip == dest.ip)
    }

    /// Pack into a u64.
    ///
    /// Layout: `[ip:32][port:16][provider:16]`
    pub fn to_u64(&self) -> u64 {
        let provider: u16 = self.provider.into();
        ((self.ip as u64) << 32) | ((self.port as u64) << 16) | (provider as u64)
    }

    pub fn from_u64(val: u64) -> Option<Self> {
        let ip = (val >> 32) as u32;
        let port = ((val >> 16) & 0xFFFF) as u16;
        let provider = Provider::try_from((val & 0xFFFF) as u16).ok()?;
        Some(Self { ip, port, provider })
    }

    /// The raw address bytes exchanged during connection handshakes.
    pub fn to_raw(&self) -> [u8; RAW_ADDR_LEN] {
        self.to_u64().to_le_bytes()
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, AddressError> {
        let bytes: [u8; RAW_ADDR_LEN] = raw
            .try_into()
            .map_err(|_| AddressError::InvalidRaw { len: raw.len() })?;
        Self::from_u64(u64::from_le_bytes(bytes)).ok_or(AddressError::InvalidRaw { len: raw.len() })
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port))
    }

    pub fn from_socket_addr(addr: SocketAddr, provider: Provider) -> Result<Self, AddressError> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(u32::from(*v4.ip()), v4.port(), provider)),
            SocketAddr::V6(v6) => Err(AddressError::NotIpv4(v6.to_string())),
        }
    }

    /// Resolve `host:port`, taking the first IPv4 result. An empty host
    /// resolves to the unspecified address.
    pub fn resolve(host: &str, port: u16, provider: Provider) -> Result<Self, AddressError> {
        if host.is_empty() {
            return Ok(Self::new(0, port, provider));
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Self::new(u32::from(ip), port, provider));
        }
        let candidates = (host, port)
            .to_socket_addrs()
            .map_err(|e| AddressError::Unresolvable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        candidates
            .filter(|a| a.is_ipv4())
            .map(|a| Self::from_socket_addr(a, provider))
            .next()
            .unwrap_or_else(|| {
                Err(AddressError::Unresolvable {
                    host: host.to_string(),
                    reason: "no IPv4 address".to_string(),
                })
            })
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}://{}.{}.{}.{}:{}", self.provider, a, b, c, d, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parse an address string like `"verbs://192.168.1.1:8080"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").ok_or(AddressError::MissingScheme)?;
        let provider: Provider = scheme
            .parse()
            .map_err(|_| AddressError::UnknownProvider(scheme.to_string()))?;

        let (ip_str, port_str) = rest.rsplit_once(':').ok_or(AddressError::MissingPort)?;
        let port: u16 = port_str.parse().map_err(|_| AddressError::InvalidPort)?;
        let ip: Ipv4Addr = ip_str.parse().map_err(|_| AddressError::InvalidIp)?;

        Ok(Address::new(u32::from(ip), port, provider))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("missing '://' scheme separator")]
    MissingScheme,
    #[error("unknown provider scheme: {0}")]
    UnknownProvider(String),
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IPv4 address")]
    InvalidIp,
    #[error("not an IPv4 address: {0}")]
    NotIpv4(String),
    #[error("cannot resolve {host}: {reason}")]
    Unresolvable { host: String, reason: String },
    #[error("invalid raw address of {len} bytes")]
    InvalidRaw { len: usize },
}

//! Canonical peer addresses.
//!
//! Every registry is keyed by [`PeerAddress`]. The textual form produced by
//! `Display` is the only one ever persisted or logged, so an address read back
//! from storage compares equal to the one that was saved.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A network endpoint identity in `host:port` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(SocketAddr);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid peer address {0:?}")]
    Invalid(String),
    #[error("peer address {0} has port 0")]
    ZeroPort(String),
    #[error("malformed binary address: {0}")]
    Binary(String),
}

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        // IPv4-mapped IPv6 addresses collapse to plain IPv4 so that the same
        // host always produces the same key.
        let ip = match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self(SocketAddr::new(ip, addr.port()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Binary form used inside the handshake: raw IP bytes (4 or 16) followed
    /// by the port as a big-endian `u32`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = match self.0.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        out.extend_from_slice(&u32::from(self.0.port()).to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let (ip, port) = match bytes.len() {
            8 => {
                let octets: [u8; 4] = bytes[..4]
                    .try_into()
                    .map_err(|_| AddressError::Binary("ipv4 octets".into()))?;
                (IpAddr::from(octets), &bytes[4..])
            }
            20 => {
                let octets: [u8; 16] = bytes[..16]
                    .try_into()
                    .map_err(|_| AddressError::Binary("ipv6 octets".into()))?;
                (IpAddr::from(octets), &bytes[16..])
            }
            n => return Err(AddressError::Binary(format!("unexpected length {n}"))),
        };
        let port_bytes: [u8; 4] = port
            .try_into()
            .map_err(|_| AddressError::Binary("port".into()))?;
        let port = u32::from_be_bytes(port_bytes);
        let port = u16::try_from(port)
            .map_err(|_| AddressError::Binary(format!("port {port} out of range")))?;
        Ok(Self::new(SocketAddr::new(ip, port)))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let addr: SocketAddr = trimmed
            .parse()
            .map_err(|_| AddressError::Invalid(trimmed.to_string()))?;
        if addr.port() == 0 {
            return Err(AddressError::ZeroPort(trimmed.to_string()));
        }
        Ok(Self::new(addr))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

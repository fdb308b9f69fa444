//! Handshake wire format and exchange.
//!
//! The handshake precedes every other byte on a connection:
//!
//! ```text
//! u8   app name length      | app name bytes
//! u32  version major        | u32 version minor | u32 version patch
//! u8   node name length     | node name bytes
//! u64  node nonce
//! u32  declared addr length | declared addr bytes (0, 8 or 20 bytes)
//! u64  timestamp (unix millis)
//! ```
//!
//! All integers are big-endian. The dialer writes first and then reads; the
//! acceptor reads first and answers with the version the dialer proposed.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::address::PeerAddress;
use crate::config::NetworkConfig;
use crate::error::HandshakeError;

const MAX_ADDRESS_BYTES: usize = 20;

/// Protocol version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Peers interoperate as long as they agree on the major version.
    pub fn is_compatible(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("invalid version {s:?}, expected major.minor.patch"));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|e| format!("invalid version component {p:?}: {e}"))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity and version header exchanged once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub app_name: String,
    pub version: Version,
    pub node_name: String,
    pub node_nonce: u64,
    pub declared_address: Option<PeerAddress>,
    pub timestamp: u64,
}

impl Handshake {
    /// Our own handshake, announcing `version`.
    pub fn local(config: &NetworkConfig, version: Version) -> Self {
        Self {
            app_name: config.app_name.clone(),
            version,
            node_name: config.node_name.clone(),
            node_nonce: config.node_nonce,
            declared_address: config.declared_address,
            timestamp: unix_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let app = self.app_name.as_bytes();
        let name = self.node_name.as_bytes();
        check_len("app name", app.len(), u8::MAX as usize)?;
        check_len("node name", name.len(), u8::MAX as usize)?;
        let address = self
            .declared_address
            .map(|a| a.to_bytes())
            .unwrap_or_default();

        let capacity = 1 + app.len() + 12 + 1 + name.len() + 8 + 4 + address.len() + 8;
        let mut out = Vec::with_capacity(capacity);
        out.put_u8(app.len() as u8);
        out.put_slice(app);
        out.put_u32(self.version.major);
        out.put_u32(self.version.minor);
        out.put_u32(self.version.patch);
        out.put_u8(name.len() as u8);
        out.put_slice(name);
        out.put_u64(self.node_nonce);
        out.put_u32(address.len() as u32);
        out.put_slice(&address);
        out.put_u64(self.timestamp);
        Ok(out)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, HandshakeError> {
        let app_len = take(&mut buf, 1)?.get_u8() as usize;
        let app_name = utf8("app name", take(&mut buf, app_len)?)?;
        let mut version = take(&mut buf, 12)?;
        let version = Version::new(version.get_u32(), version.get_u32(), version.get_u32());
        let name_len = take(&mut buf, 1)?.get_u8() as usize;
        let node_name = utf8("node name", take(&mut buf, name_len)?)?;
        let node_nonce = take(&mut buf, 8)?.get_u64();
        let addr_len = take(&mut buf, 4)?.get_u32() as usize;
        check_len("declared address", addr_len, MAX_ADDRESS_BYTES)?;
        let declared_address = parse_address(take(&mut buf, addr_len)?)?;
        let timestamp = take(&mut buf, 8)?.get_u64();
        if !buf.is_empty() {
            return Err(HandshakeError::Malformed(format!(
                "{} trailing bytes",
                buf.len()
            )));
        }

        Ok(Self {
            app_name,
            version,
            node_name,
            node_nonce,
            declared_address,
            timestamp,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), HandshakeError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads exactly one handshake, field by field, so that nothing belonging
    /// to the first frame is consumed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let app_len = reader.read_u8().await.map_err(short_read)? as usize;
        let app_name = utf8("app name", &read_n(reader, app_len).await?)?;
        let major = reader.read_u32().await.map_err(short_read)?;
        let minor = reader.read_u32().await.map_err(short_read)?;
        let patch = reader.read_u32().await.map_err(short_read)?;
        let name_len = reader.read_u8().await.map_err(short_read)? as usize;
        let node_name = utf8("node name", &read_n(reader, name_len).await?)?;
        let node_nonce = reader.read_u64().await.map_err(short_read)?;
        let addr_len = reader.read_u32().await.map_err(short_read)? as usize;
        check_len("declared address", addr_len, MAX_ADDRESS_BYTES)?;
        let declared_address = parse_address(&read_n(reader, addr_len).await?)?;
        let timestamp = reader.read_u64().await.map_err(short_read)?;

        Ok(Self {
            app_name,
            version: Version::new(major, minor, patch),
            node_name,
            node_nonce,
            declared_address,
            timestamp,
        })
    }

    /// Checks a remote handshake against our configuration.
    pub fn validate(&self, config: &NetworkConfig) -> Result<(), HandshakeError> {
        if self.app_name != config.app_name {
            return Err(HandshakeError::AppNameMismatch {
                expected: config.app_name.clone(),
                actual: self.app_name.clone(),
            });
        }
        if !config.versions.iter().any(|v| v.is_compatible(&self.version)) {
            return Err(HandshakeError::IncompatibleVersion {
                peer: self.version,
                ours: config.preferred_version(),
            });
        }
        if let (Some(theirs), Some(ours)) = (self.declared_address, config.declared_address) {
            if theirs == ours {
                return Err(HandshakeError::SelfConnection(theirs.to_string()));
            }
        }
        if self.node_nonce == config.node_nonce {
            return Err(HandshakeError::SelfConnection(format!(
                "nonce {}",
                self.node_nonce
            )));
        }
        Ok(())
    }
}

/// Dialer side: write ours, then read and validate theirs.
pub async fn outgoing<S>(
    stream: &mut S,
    config: &NetworkConfig,
    version: Version,
    cancel: &CancellationToken,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::local(config, version);
    bounded(cancel, config.handshake_timeout, ours.write_to(stream)).await?;
    let theirs = bounded(cancel, config.handshake_timeout, Handshake::read_from(stream)).await?;
    theirs.validate(config)?;
    if !theirs.version.is_compatible(&version) {
        return Err(HandshakeError::IncompatibleVersion {
            peer: theirs.version,
            ours: version,
        });
    }
    Ok(theirs)
}

/// Acceptor side: read and validate theirs, then answer with their version.
///
/// A dialer rejected for a mismatched app name or a self connection still
/// gets our handshake, so it fails with the same non-retryable error instead
/// of seeing a bare hang-up.
pub async fn incoming<S>(
    stream: &mut S,
    config: &NetworkConfig,
    cancel: &CancellationToken,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = bounded(cancel, config.handshake_timeout, Handshake::read_from(stream)).await?;
    if let Err(e) = theirs.validate(config) {
        if matches!(
            e,
            HandshakeError::SelfConnection(_) | HandshakeError::AppNameMismatch { .. }
        ) {
            let ours = Handshake::local(config, theirs.version);
            let _ = bounded(cancel, config.handshake_timeout, ours.write_to(stream)).await;
        }
        return Err(e);
    }
    let ours = Handshake::local(config, theirs.version);
    bounded(cancel, config.handshake_timeout, ours.write_to(stream)).await?;
    Ok(theirs)
}

async fn bounded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(HandshakeError::Timeout(limit)),
        },
    }
}

async fn read_n<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(short_read)?;
    Ok(buf)
}

fn short_read(err: std::io::Error) -> HandshakeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        HandshakeError::Malformed("short read".to_string())
    } else {
        HandshakeError::Io(err)
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], HandshakeError> {
    if buf.len() < len {
        return Err(HandshakeError::Malformed(format!(
            "short read: need {len} bytes, have {}",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn utf8(field: &str, bytes: &[u8]) -> Result<String, HandshakeError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| HandshakeError::Malformed(format!("{field} is not valid utf-8")))
}

fn parse_address(bytes: &[u8]) -> Result<Option<PeerAddress>, HandshakeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    PeerAddress::from_bytes(bytes)
        .map(Some)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), HandshakeError> {
    if len > max {
        return Err(HandshakeError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

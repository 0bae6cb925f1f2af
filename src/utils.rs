use crate::hash_table::string_hash;
use crate::message::CodecError;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const ID_BITS: u32 = 16; // Width of the identifier space
pub const MAX_DATAGRAM: usize = 65_535;
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Position on the ring. Node identifiers and hashed keys share this space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Places a key on the ring: the low 16 bits of its djb2 hash.
    pub fn from_key(key: &[u8]) -> Self {
        NodeId(string_hash(key) as u16)
    }

    /// Derives an identifier from the first two bytes of SHA-256(addr).
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let digest = Sha256::digest(addr.to_string().as_bytes());
        NodeId(u16::from_be_bytes([digest[0], digest[1]]))
    }

    /// Clockwise distance from `self` to `other`.
    pub fn distance_to(&self, other: &NodeId) -> u16 {
        other.0.wrapping_sub(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Deserializes a millisecond count into a `Duration`.
pub fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

pub fn deserialize_opt_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Explicit ring identifier; derived from `bind_addr` when absent.
    pub node_id: Option<u16>,
    /// Existing ring member to send JOIN to. Absent for the first node.
    pub registration: Option<SocketAddr>,
    #[serde(rename = "forward_timeout_ms", deserialize_with = "deserialize_millis")]
    pub forward_timeout: Duration,
    #[serde(
        rename = "stabilize_interval_ms",
        deserialize_with = "deserialize_opt_millis"
    )]
    pub stabilize_interval: Option<Duration>,
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: None,
            registration: None,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            stabilize_interval: None,
            recv_buffer_size: MAX_DATAGRAM,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, RingError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| RingError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| RingError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RingError> {
        if self.recv_buffer_size < crate::message::EXT_HEADER_LEN {
            return Err(RingError::Config(format!(
                "recv_buffer_size {} is smaller than a request header",
                self.recv_buffer_size
            )));
        }
        if self.forward_timeout.is_zero() {
            return Err(RingError::Config("forward_timeout must be non-zero".into()));
        }
        if self.stabilize_interval.map_or(false, |i| i.is_zero()) {
            return Err(RingError::Config("stabilize_interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn distance_wraps_past_max() {
        assert_eq!(NodeId(u16::MAX).distance_to(&NodeId(1)), 2);
        assert_eq!(NodeId(10).distance_to(&NodeId(4)), u16::MAX - 5);
    }

    #[test]
    fn key_id_is_truncated_djb2() {
        assert_eq!(NodeId::from_key(b"a"), NodeId(((5381u64 * 33 + 97) & 0xFFFF) as u16));
    }

    #[test]
    fn derived_id_is_stable() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(NodeId::from_addr(&addr), NodeId::from_addr(&addr));
    }

    #[test]
    fn config_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"bind_addr": "127.0.0.1:7000", "node_id": 42, "forward_timeout_ms": 250, "stabilize_interval_ms": 1000}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.node_id, Some(42));
        assert_eq!(config.registration, None);
        assert_eq!(config.forward_timeout, Duration::from_millis(250));
        assert_eq!(config.stabilize_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.recv_buffer_size, MAX_DATAGRAM);
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let config = Config {
            forward_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(RingError::Config(_))));
    }
}

//! Server endpoints and carrier protocol sets.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::{TransportError, TransportResult};

/// Host and port of a CM server
///
/// The host is kept unresolved so that WebSocket connections can present it
/// for TLS verification; TCP and UDP resolve it at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name or IP literal and a port
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Host name or IP literal (IPv6 without brackets)
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to the first socket address
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolve`] if the lookup fails or yields nothing.
    pub fn resolve(&self) -> TransportResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{self}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Resolve(self.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{s}: missing port")))?;

        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(format!("{s}: invalid port")))?;

        let endpoint = Self::new(host, port);
        if endpoint.host.is_empty() || port == 0 {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        Ok(endpoint)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Set of carriers a server can be reached over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProtocolTypes(u8);

impl ProtocolTypes {
    /// No carriers
    pub const NONE: Self = Self(0);
    /// Framed TCP
    pub const TCP: Self = Self(0b001);
    /// Sequenced UDP
    pub const UDP: Self = Self(0b010);
    /// WebSocket over TLS
    pub const WEB_SOCKET: Self = Self(0b100);
    /// Every carrier
    pub const ALL: Self = Self(0b111);

    /// Build from raw bits, dropping unknown ones
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every carrier in `other` is present
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any carrier is shared with `other`
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no carrier is set
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Single-carrier sets contained in this set, lowest bit first
    pub fn iter(self) -> impl Iterator<Item = ProtocolTypes> {
        [Self::TCP, Self::UDP, Self::WEB_SOCKET]
            .into_iter()
            .filter(move |p| self.contains(*p))
    }

    /// Parse a carrier name (`tcp`, `udp`, `websocket`, `all`)
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::TCP),
            "udp" => Some(Self::UDP),
            "websocket" | "ws" | "wss" => Some(Self::WEB_SOCKET),
            "all" => Some(Self::ALL),
            _ => None,
        }
    }
}

impl BitOr for ProtocolTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProtocolTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ProtocolTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for ProtocolTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self
            .iter()
            .map(|p| match p {
                Self::TCP => "tcp",
                Self::UDP => "udp",
                _ => "websocket",
            })
            .collect();
        f.write_str(&names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "cm1.example.net:27017".parse().unwrap();
        assert_eq!(ep.host(), "cm1.example.net");
        assert_eq!(ep.port(), 27017);
        assert_eq!(ep.to_string(), "cm1.example.net:27017");
    }

    #[test]
    fn test_endpoint_parse_ipv6() {
        let ep: Endpoint = "[::1]:443".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:443");
        assert_eq!(ep.resolve().unwrap(), "[::1]:443".parse().unwrap());
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:0".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:27020".parse().unwrap();
        let ep = Endpoint::from(addr);
        assert_eq!(ep.resolve().unwrap(), addr);
    }

    #[test]
    fn test_protocol_types_bits() {
        assert_eq!(ProtocolTypes::ALL.bits(), 7);
        assert_eq!(ProtocolTypes::TCP | ProtocolTypes::UDP | ProtocolTypes::WEB_SOCKET, ProtocolTypes::ALL);
        assert!(ProtocolTypes::ALL.contains(ProtocolTypes::UDP));
        assert!(!ProtocolTypes::TCP.intersects(ProtocolTypes::UDP));
        assert_eq!(ProtocolTypes::from_bits(0xFF), ProtocolTypes::ALL);
    }

    #[test]
    fn test_protocol_types_iter() {
        let split: Vec<_> = (ProtocolTypes::TCP | ProtocolTypes::WEB_SOCKET).iter().collect();
        assert_eq!(split, vec![ProtocolTypes::TCP, ProtocolTypes::WEB_SOCKET]);
        assert_eq!(ProtocolTypes::NONE.iter().count(), 0);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(ProtocolTypes::from_name("WebSocket"), Some(ProtocolTypes::WEB_SOCKET));
        assert_eq!(ProtocolTypes::from_name("bogus"), None);
        assert_eq!((ProtocolTypes::TCP | ProtocolTypes::UDP).to_string(), "tcp|udp");
    }
}

//! Queue server addresses.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// `host:port` of a queue server; also its node identity in notifications.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ServerAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::invalid("server address", s))?;
        if host.is_empty() {
            return Err(ProtocolError::invalid("server address", s));
        }
        let port = port
            .parse()
            .map_err(|_| ProtocolError::invalid("server address", s))?;
        Ok(ServerAddress::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr: ServerAddress = "ns1.example.org:9100".parse().unwrap();
        assert_eq!(addr, ServerAddress::new("ns1.example.org", 9100));
        assert_eq!(addr.to_string(), "ns1.example.org:9100");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("ns1".parse::<ServerAddress>().is_err());
        assert!(":9100".parse::<ServerAddress>().is_err());
        assert!("ns1:http".parse::<ServerAddress>().is_err());
    }
}

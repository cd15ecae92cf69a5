//! Core domain types

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An addressable TCP target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IP address (IPv6 without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `0.0.0.0:<port>`, the address a remote listener binds on the broker
    pub fn any(port: u16) -> Self {
        Self::new("0.0.0.0", port)
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
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// The inclusive range of ports the broker may hand out
///
/// Written as `"start-end"` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Create a validated range
    ///
    /// The pool's round-robin scan never re-examines the most recently
    /// assigned slot, so a usable range needs at least two ports.
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPortRange {
            range: format!("{}-{}", start, end),
            reason: reason.to_string(),
        };
        if start == 0 {
            return Err(invalid("port 0 is not assignable"));
        }
        if start > end {
            return Err(invalid("start is greater than end"));
        }
        if start == end {
            return Err(invalid("range must contain at least two ports"));
        }
        Ok(Self { start, end })
    }

    /// First port of the range
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last port of the range
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false for a validated range
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `port` lies inside the range
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Iterate the ports in increasing order
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPortRange {
            range: s.to_string(),
            reason: reason.to_string(),
        };
        let (start, end) = s.trim().split_once('-').ok_or_else(|| invalid("expected start-end"))?;
        let start = start
            .trim()
            .parse::<u16>()
            .map_err(|_| invalid("start is not a port number"))?;
        let end = end
            .trim()
            .parse::<u16>()
            .map_err(|_| invalid("end is not a port number"))?;
        Self::new(start, end)
    }
}

impl TryFrom<String> for PortRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("localhost", 22).to_string(), "localhost:22");
        assert_eq!(Endpoint::any(9000).to_string(), "0.0.0.0:9000");
        assert_eq!(Endpoint::new("::1", 2222).to_string(), "[::1]:2222");
    }

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "broker.example.net:22".parse().unwrap();
        assert_eq!(ep, Endpoint::new("broker.example.net", 22));

        let ep: Endpoint = "[::1]:2222".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 2222);

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":22".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_port_range_parse() {
        let range: PortRange = "9000-9001".parse().unwrap();
        assert_eq!(range.start(), 9000);
        assert_eq!(range.end(), 9001);
        assert_eq!(range.len(), 2);
        assert!(range.contains(9000));
        assert!(range.contains(9001));
        assert!(!range.contains(9002));
        assert_eq!(range.ports().collect::<Vec<_>>(), vec![9000, 9001]);
    }

    #[test]
    fn test_port_range_rejects_bad_input() {
        for bad in ["", "9000", "9001-9000", "0-10", "a-b", "9000-", "9000-9000", "1-70000"] {
            assert!(bad.parse::<PortRange>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_port_range_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            range: PortRange,
        }
        let holder: Holder = toml::from_str(r#"range = "20000-20099""#).unwrap();
        assert_eq!(holder.range.len(), 100);
        let text = toml::to_string(&holder).unwrap();
        assert!(text.contains(r#"range = "20000-20099""#));

        assert!(toml::from_str::<Holder>(r#"range = "20099-20000""#).is_err());
    }
}

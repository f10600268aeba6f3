use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::SdamError;

pub const DEFAULT_PORT: u16 = 27017;

/// The canonical `host:port` identity of a node. Host names are lower-cased so that
/// two spellings of the same host compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim_end_matches('.').to_lowercase(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(address: &str) -> Result<Self, SdamError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SdamError::InvalidArgument(
                "server address must not be empty".to_string(),
            ));
        }

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| {
                SdamError::InvalidArgument(format!("unterminated IPv6 literal in `{}`", address))
            })?;
            let host = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(port) => Some(port),
                None if rest[end + 1..].is_empty() => None,
                None => {
                    return Err(SdamError::InvalidArgument(format!(
                        "unexpected characters after IPv6 literal in `{}`",
                        address
                    )))
                }
            };
            (host, port)
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(SdamError::InvalidArgument(format!(
                "missing host in `{}`",
                address
            )));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|e| {
                SdamError::InvalidArgument(format!("invalid port in `{}`: {}", address, e))
            })?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(SdamError::InvalidArgument(format!(
                "port 0 is not a valid server port in `{}`",
                address
            )));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = SdamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = SdamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> Self {
        address.to_string()
    }
}

//! Target address parsing.

use crate::error::SessionError;
use hyper::Uri;
use std::fmt;

/// Where the load goes: a plain-HTTP host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Accepts `host:port`, `host`, `http://host:port` or `http://host:port/any/path`.
    /// A missing port means 80.
    pub fn parse(address: &str) -> Result<Self, SessionError> {
        let trimmed = address.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };
        let uri: Uri = with_scheme
            .parse()
            .map_err(|_| SessionError::InvalidTarget(address.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(SessionError::InvalidTarget(address.to_string()));
        }
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SessionError::InvalidTarget(address.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(80),
        })
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}{}", self.authority(), path)
        } else {
            format!("http://{}/{}", self.authority(), path)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

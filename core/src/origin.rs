//! Scheme/host/port triples identifying logical endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// A logical endpoint: scheme, lower-cased host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

/// Port assumed when a URI or Alt-Svc authority omits one.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" | "h2" | "h3" => Some(443),
        _ => None,
    }
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase(),
            port,
        }
    }

    /// Origin of an absolute URI. Fails with `Usage` when the URI has no host
    /// or its scheme has neither an explicit nor a default port.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Usage(format!("{url}: URI has no host")))?;
        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| Error::Usage(format!("{url}: URI has no port")))?;
        Ok(Self::new(url.scheme(), host, port))
    }

    /// `host:port`, bracketing IPv6 literals. Used for `alt-used`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_fills_default_port() {
        let url = Url::parse("https://Example.COM/path").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin, Origin::new("https", "example.com", 443));
        assert_eq!(origin.to_string(), "https://example.com:443");
    }

    #[test]
    fn from_url_keeps_explicit_port() {
        let url = Url::parse("http://localhost:8080/").unwrap();
        assert_eq!(Origin::from_url(&url).unwrap().port, 8080);
    }

    #[test]
    fn from_url_rejects_unknown_scheme_without_port() {
        let url = Url::parse("gopher://example.com/").unwrap();
        assert!(matches!(Origin::from_url(&url), Err(Error::Usage(_))));
    }

    #[test]
    fn ipv6_hosts_are_bracketed_in_authority() {
        let url = Url::parse("http://[::1]:8080/").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.host, "::1");
        assert_eq!(origin.authority(), "[::1]:8080");
    }
}

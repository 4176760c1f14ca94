//! Hostname resolution.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use log::debug;

use crate::error::{Error, Result};

/// Resolves a hostname to the single address channels are opened to.
pub trait Resolver {
    fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Blocking resolver backed by hickory, reading the system configuration.
pub struct DnsResolver {
    inner: hickory_resolver::Resolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self {
            inner: hickory_resolver::Resolver::from_system_conf()?,
        })
    }

    /// Resolver using public upstreams with a per-query timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        opts.ndots = 0;
        Ok(Self {
            inner: hickory_resolver::Resolver::new(ResolverConfig::default(), opts)?,
        })
    }
}

impl Resolver for DnsResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let lookup = self.inner.lookup_ip(host).map_err(|e| Error::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let ip = lookup.iter().next().ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })?;
        debug!("resolved {host} to {ip}");
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_skip_the_lookup() {
        let resolver = DnsResolver::with_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(resolver.resolve("127.0.0.1").unwrap(), IpAddr::from([127, 0, 0, 1]));
        assert_eq!(resolver.resolve("::1").unwrap().to_string(), "::1");
    }
}

//! Node address resolution.
//!
//! Configured addresses are IP literals or mDNS names. Anything naming this
//! controller (`localhost`, `127.0.0.1`, `<system_name>.local`) resolves to
//! the loopback interface without a lookup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use hydro_core::NodeAddress;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty node address")]
    Empty,

    #[error("no address found for {0}")]
    NotFound(String),

    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a node address points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedHost {
    Local,
    Remote(IpAddr),
}

impl ResolvedHost {
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Remote(ip) => *ip,
        }
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip(), port)
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, address: &NodeAddress) -> Result<ResolvedHost, ResolveError>;
}

/// Resolves through the operating system (which handles `.local` when an
/// mDNS responder is installed).
#[derive(Debug, Clone)]
pub struct SystemResolver {
    system_name: String,
}

impl SystemResolver {
    pub fn new(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
        }
    }
}

/// Classifies an address without touching the network.
///
/// Returns `None` when a lookup is required.
pub fn classify(address: &str, system_name: &str) -> Option<ResolvedHost> {
    let host = address.trim();
    let own_mdns = format!("{}.local", system_name.trim());
    if host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || (!system_name.trim().is_empty() && host.eq_ignore_ascii_case(&own_mdns))
    {
        return Some(ResolvedHost::Local);
    }
    host.parse::<IpAddr>().ok().map(|ip| {
        if ip.is_loopback() {
            ResolvedHost::Local
        } else {
            ResolvedHost::Remote(ip)
        }
    })
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, address: &NodeAddress) -> Result<ResolvedHost, ResolveError> {
        if address.is_empty() {
            return Err(ResolveError::Empty);
        }
        if let Some(resolved) = classify(address.as_str(), &self.system_name) {
            return Ok(resolved);
        }

        let host = address.as_str().trim().to_string();
        let addrs = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.clone(),
                source,
            })?;
        let addrs: Vec<SocketAddr> = addrs.collect();
        let chosen = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .ok_or_else(|| ResolveError::NotFound(host.clone()))?;

        debug!(node = %address, ip = %chosen.ip(), "Resolved node address");
        Ok(if chosen.ip().is_loopback() {
            ResolvedHost::Local
        } else {
            ResolvedHost::Remote(chosen.ip())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_local_names() {
        assert_eq!(classify("localhost", "Garden"), Some(ResolvedHost::Local));
        assert_eq!(classify("127.0.0.1", "Garden"), Some(ResolvedHost::Local));
        assert_eq!(classify("garden.local", "Garden"), Some(ResolvedHost::Local));
        assert_eq!(classify(".local", ""), None);
    }

    #[test]
    fn test_classify_literals() {
        assert_eq!(
            classify("10.0.0.7", "Garden"),
            Some(ResolvedHost::Remote(IpAddr::from([10, 0, 0, 7])))
        );
        assert_eq!(classify("tent-b.local", "Garden"), None);
    }

    #[test]
    fn test_socket_addr_formatting() {
        let host = ResolvedHost::Remote("fe80::1".parse().unwrap());
        assert_eq!(host.socket_addr(8000).to_string(), "[fe80::1]:8000");
        assert_eq!(ResolvedHost::Local.socket_addr(8001).to_string(), "127.0.0.1:8001");
    }

    #[tokio::test]
    async fn test_empty_address_is_error() {
        let resolver = SystemResolver::new("Garden");
        assert!(matches!(
            resolver.resolve(&NodeAddress::new("  ")).await,
            Err(ResolveError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_own_name_skips_lookup() {
        let resolver = SystemResolver::new("Garden");
        assert_eq!(
            resolver.resolve(&NodeAddress::new("Garden.local")).await.unwrap(),
            ResolvedHost::Local
        );
    }
}

//! DNS resolution through the system resolver.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::{InfraError, InfraResult};
use crate::traits::DnsResolve;

/// [`DnsResolve`] backed by the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

impl SystemDnsResolver {
    /// Create a system resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DnsResolve for SystemDnsResolver {
    async fn lookup_a(&self, domain: &str) -> InfraResult<Vec<Ipv4Addr>> {
        // The port is required by the lookup API and discarded.
        let addrs = tokio::net::lookup_host((domain, 443))
            .await
            .map_err(|e| InfraError::adapter("dns", format!("{domain} does not resolve: {e}")))?;

        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect())
    }
}

//! Load balancer DNS resolution check.

use async_trait::async_trait;
use tracing::debug;

/// Answers whether a host name currently resolves
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// `true` when at least one address is returned for `host`
    async fn resolves(&self, host: &str) -> bool;
}

/// Resolver using the system resolver through tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolves(&self, host: &str) -> bool {
        match tokio::net::lookup_host((host, 443)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!("DNS lookup of {} failed: {}", host, e);
                false
            }
        }
    }
}

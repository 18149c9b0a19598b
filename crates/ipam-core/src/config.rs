use serde::{Deserialize, Serialize};

/// Deployment-level quotas and feature switches consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamLimits {
    /// Maximum number of DNS nameservers per subnet.
    pub max_dns_nameservers: usize,
    /// Maximum number of host routes per subnet.
    pub max_subnet_host_routes: usize,
    /// Whether IPv6 prefix delegation may be used instead of a local pool.
    pub ipv6_pd_enabled: bool,
    /// How often an operation is re-run after a transient store conflict
    /// before the conflict is surfaced to the caller.
    pub store_retry_limit: u32,
}

impl Default for IpamLimits {
    fn default() -> Self {
        Self {
            max_dns_nameservers: 5,
            max_subnet_host_routes: 20,
            ipv6_pd_enabled: false,
            store_retry_limit: 3,
        }
    }
}

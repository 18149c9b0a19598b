use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::subnet::SubnetId;

pub type NetworkId = Uuid;
pub type PortId = Uuid;
pub type RouterId = Uuid;

/// Target tenant of an access grant that covers every tenant.
pub const WILDCARD_TENANT: &str = "*";

/// Well-known port device owners. Ports owned by network infrastructure are
/// ignored by the sharing consistency check, and DHCP ports never block a
/// subnet deletion.
pub mod device_owner {
    pub const NETWORK_PREFIX: &str = "network:";
    pub const DHCP: &str = "network:dhcp";
    pub const ROUTER_INTERFACE: &str = "network:router_interface";
    pub const ROUTER_INTERFACE_DISTRIBUTED: &str = "network:router_interface_distributed";
    pub const ROUTER_GATEWAY: &str = "network:router_gateway";

    /// Owners whose address allocations are cleaned up automatically instead
    /// of blocking subnet deletion.
    pub const AUTO_DELETE_OWNERS: &[&str] = &[DHCP];

    pub fn is_router_interface(owner: &str) -> bool {
        owner == ROUTER_INTERFACE || owner == ROUTER_INTERFACE_DISTRIBUTED
    }

    pub fn is_network_owned(owner: &str) -> bool {
        owner.starts_with(NETWORK_PREFIX)
    }

    pub fn is_auto_delete(owner: &str) -> bool {
        AUTO_DELETE_OWNERS.contains(&owner)
    }
}

/// Owning network of zero or more subnets; the unit against which sharing
/// policy is evaluated. `shared` is derived from the presence of a wildcard
/// access grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub tenant_id: String,
    pub name: String,
    pub shared: bool,
    pub external: bool,
}

/// An `access_as_shared` grant letting `target_tenant` attach ports to the
/// network. A `*` target covers any tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub network_id: NetworkId,
    pub target_tenant: String,
}

/// One address assignment of a port. The address is cleared while a
/// prefix-delegation renumbering is waiting for re-allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: SubnetId,
    pub ip_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub network_id: NetworkId,
    pub tenant_id: String,
    pub device_id: String,
    pub device_owner: String,
    pub fixed_ips: Vec<FixedIp>,
}

/// Patch applied to a port through the port directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortPatch {
    pub fixed_ips: Option<Vec<FixedIp>>,
}

/// External gateway state of a router, as reported by the L3 service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRef {
    pub id: RouterId,
    pub external_fixed_ips: Vec<FixedIp>,
}

/// Identity of the caller performing a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub is_admin: bool,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            is_admin: true,
        }
    }

    pub fn owns(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }
}

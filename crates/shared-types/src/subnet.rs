use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IpamError, IpamResult};
use crate::network::NetworkId;
use crate::pool::SubnetPoolId;

pub type SubnetId = Uuid;

/// Placeholder prefix assigned to a prefix-delegation subnet until the real
/// prefix arrives from the upstream delegating source.
pub const PROVISIONAL_V6_PD_CIDR: &str = "::/64";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of_addr(addr: &IpAddr) -> IpVersion {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> IpVersion {
        match net {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        }
    }

    pub fn max_prefix_len(&self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "4"),
            IpVersion::V6 => write!(f, "6"),
        }
    }
}

/// IPv6 addressing mode, used for both router-advertisement and address
/// assignment configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ipv6Mode {
    Slaac,
    Dhcpv6Stateful,
    Dhcpv6Stateless,
}

impl Ipv6Mode {
    /// Addresses are derived automatically (EUI-64) rather than leased.
    pub fn is_auto_address(&self) -> bool {
        matches!(self, Ipv6Mode::Slaac | Ipv6Mode::Dhcpv6Stateless)
    }
}

impl std::fmt::Display for Ipv6Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ipv6Mode::Slaac => write!(f, "slaac"),
            Ipv6Mode::Dhcpv6Stateful => write!(f, "dhcpv6-stateful"),
            Ipv6Mode::Dhcpv6Stateless => write!(f, "dhcpv6-stateless"),
        }
    }
}

/// Reference from a subnet to the pool its prefix was carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetPoolRef {
    /// A concrete pool held by this control plane.
    Pool(SubnetPoolId),
    /// The reserved IPv6 prefix-delegation pool: the prefix is assigned
    /// out-of-band by an upstream source.
    PrefixDelegation,
}

/// Inclusive address range from which port addresses may be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPool {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl AllocationPool {
    pub fn new(start: IpAddr, end: IpAddr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        *addr >= self.start && *addr <= self.end
    }
}

impl std::fmt::Display for AllocationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Static route pushed to instances on the subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

/// A concrete address block bound to a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub network_id: NetworkId,
    pub tenant_id: String,
    pub name: String,
    pub ip_version: IpVersion,
    pub cidr: IpNet,
    pub gateway_ip: Option<IpAddr>,
    pub enable_dhcp: bool,
    pub allocation_pools: Vec<AllocationPool>,
    pub host_routes: Vec<HostRoute>,
    pub dns_nameservers: Vec<IpAddr>,
    pub ipv6_ra_mode: Option<Ipv6Mode>,
    pub ipv6_address_mode: Option<Ipv6Mode>,
    pub subnetpool: Option<SubnetPoolRef>,
}

impl Subnet {
    /// Whether ports on this subnet get addresses automatically (SLAAC or
    /// DHCPv6 stateless).
    pub fn is_auto_address(&self) -> bool {
        self.ipv6_ra_mode.map_or(false, |m| m.is_auto_address())
            || self.ipv6_address_mode.map_or(false, |m| m.is_auto_address())
    }

    /// Whether this subnet takes its prefix from the delegation pool.
    pub fn is_prefix_delegation(&self) -> bool {
        matches!(self.subnetpool, Some(SubnetPoolRef::PrefixDelegation))
    }
}

/// Immutable subnet creation request.
///
/// Exactly one of `cidr` or `prefixlen` may be set; `prefixlen` requires a
/// subnet pool. Stages derive new values from this instead of mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub network_id: NetworkId,
    pub tenant_id: String,
    pub name: String,
    pub ip_version: IpVersion,
    pub cidr: Option<IpNet>,
    pub prefixlen: Option<u8>,
    pub gateway_ip: Option<IpAddr>,
    pub enable_dhcp: bool,
    pub allocation_pools: Option<Vec<AllocationPool>>,
    pub host_routes: Vec<HostRoute>,
    pub dns_nameservers: Vec<IpAddr>,
    pub ipv6_ra_mode: Option<Ipv6Mode>,
    pub ipv6_address_mode: Option<Ipv6Mode>,
    pub subnetpool: Option<SubnetPoolRef>,
    pub use_default_subnetpool: bool,
}

impl SubnetSpec {
    pub fn new(network_id: NetworkId, tenant_id: impl Into<String>, ip_version: IpVersion) -> Self {
        Self {
            network_id,
            tenant_id: tenant_id.into(),
            name: String::new(),
            ip_version,
            cidr: None,
            prefixlen: None,
            gateway_ip: None,
            enable_dhcp: false,
            allocation_pools: None,
            host_routes: Vec::new(),
            dns_nameservers: Vec::new(),
            ipv6_ra_mode: None,
            ipv6_address_mode: None,
            subnetpool: None,
            use_default_subnetpool: false,
        }
    }

    pub fn with_cidr(mut self, cidr: IpNet) -> Self {
        self.cidr = Some(cidr);
        self
    }

    pub fn is_auto_address(&self) -> bool {
        self.ipv6_ra_mode.map_or(false, |m| m.is_auto_address())
            || self.ipv6_address_mode.map_or(false, |m| m.is_auto_address())
    }

    pub fn is_prefix_delegation(&self) -> bool {
        matches!(self.subnetpool, Some(SubnetPoolRef::PrefixDelegation))
    }

    /// The prefix length being requested, if any.
    pub fn requested_prefixlen(&self) -> IpamResult<Option<u8>> {
        match (self.cidr, self.prefixlen) {
            (Some(_), Some(_)) => Err(IpamError::invalid_input(
                "cidr and prefixlen must not be supplied together",
            )),
            (Some(cidr), None) => Ok(Some(cidr.prefix_len())),
            (None, len) => Ok(len),
        }
    }
}

/// Partial update applied to an existing subnet. Unset fields keep their
/// current value. `cidr` is only accepted on the prefix-delegation
/// renumbering path; the ipv6 modes are fixed at creation and carry no
/// update counterpart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetUpdate {
    pub name: Option<String>,
    pub cidr: Option<IpNet>,
    /// `Some(None)` clears the gateway, `Some(Some(_))` replaces it.
    pub gateway_ip: Option<Option<IpAddr>>,
    pub enable_dhcp: Option<bool>,
    pub allocation_pools: Option<Vec<AllocationPool>>,
    pub host_routes: Option<Vec<HostRoute>>,
    pub dns_nameservers: Option<Vec<IpAddr>>,
}

impl SubnetUpdate {
    /// Derive the post-update subnet state without touching the original.
    pub fn apply_to(&self, current: &Subnet) -> Subnet {
        let mut target = current.clone();
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(cidr) = self.cidr {
            target.cidr = cidr;
        }
        if let Some(gateway) = self.gateway_ip {
            target.gateway_ip = gateway;
        }
        if let Some(enable_dhcp) = self.enable_dhcp {
            target.enable_dhcp = enable_dhcp;
        }
        if let Some(pools) = &self.allocation_pools {
            target.allocation_pools = pools.clone();
        }
        if let Some(routes) = &self.host_routes {
            target.host_routes = routes.clone();
        }
        if let Some(dns) = &self.dns_nameservers {
            target.dns_nameservers = dns.clone();
        }
        target
    }
}

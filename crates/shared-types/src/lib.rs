//! Shared types for the virtual-network address management core
//!
//! Data model and error taxonomy used by the allocator, validator and
//! collaborating services.

pub mod error;
pub mod events;
pub mod network;
pub mod pool;
pub mod subnet;

pub use error::{IpamError, IpamResult};
pub use events::IpamEvent;
pub use network::{
    device_owner, AccessGrant, FixedIp, Network, NetworkId, Port, PortId, PortPatch, RouterId,
    RouterRef, TenantContext, WILDCARD_TENANT,
};
pub use pool::{
    AddressScope, AddressScopeId, SubnetPool, SubnetPoolId, SubnetPoolSpec, SubnetPoolUpdate,
};
pub use subnet::{
    AllocationPool, HostRoute, IpVersion, Ipv6Mode, Subnet, SubnetId, SubnetPoolRef, SubnetSpec,
    SubnetUpdate, PROVISIONAL_V6_PD_CIDR,
};

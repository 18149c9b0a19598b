//! Address-management core for tenant-isolated virtual networks
//!
//! Allocates, validates and reclaims subnets, subnet pools and address
//! scopes, and enforces the consistency rules between them: no overlapping
//! prefixes inside a pool or an address scope, no orphaned allocations, no
//! revocation of shared access while foreign tenants still depend on it.

pub mod addr_math;
pub mod allocator;
pub mod config;
pub mod pool;
pub mod service;
pub mod share;
pub mod validator;


pub use allocator::{SubnetAllocator, SubnetRequest};
pub use config::IpamLimits;
pub use service::IpamService;
pub use share::{ShareConsistencyChecker, ShareGuard};
pub use validator::{CurrentSubnet, SubnetValidator};

//! Transactional entity store and collaborator interfaces.
//!
//! The store holds the entities owned by the address-management core
//! (networks, subnets, pools, scopes, access grants) behind a
//! snapshot-and-commit transaction provider. Ports and routers belong to
//! other services and are reached through the [`PortDirectory`] and
//! [`RouterService`] traits.

pub mod memory;
pub mod ports;

pub use memory::{MemoryStore, StoreState};
pub use ports::{MemoryPortDirectory, MemoryRouterService, PortDirectory, RouterService};

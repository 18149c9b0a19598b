use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subnet::IpVersion;

pub type SubnetPoolId = Uuid;
pub type AddressScopeId = Uuid;

/// A reservoir of address prefixes from which concrete subnet CIDRs are
/// carved. Prefixes are kept compacted (merged, ascending) and may only ever
/// grow, so that subnets already carved from the pool are never orphaned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetPool {
    pub id: SubnetPoolId,
    pub tenant_id: String,
    pub name: String,
    pub ip_version: IpVersion,
    pub prefixes: Vec<IpNet>,
    pub min_prefixlen: u8,
    pub default_prefixlen: u8,
    pub max_prefixlen: u8,
    pub is_default: bool,
    pub shared: bool,
    pub address_scope_id: Option<AddressScopeId>,
}

/// Creation request for a subnet pool. Prefix-length bounds default per
/// address family when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetPoolSpec {
    pub tenant_id: String,
    pub name: String,
    pub prefixes: Vec<IpNet>,
    pub min_prefixlen: Option<u8>,
    pub default_prefixlen: Option<u8>,
    pub max_prefixlen: Option<u8>,
    pub is_default: bool,
    pub shared: bool,
    pub address_scope_id: Option<AddressScopeId>,
}

impl SubnetPoolSpec {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, prefixes: Vec<IpNet>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            prefixes,
            min_prefixlen: None,
            default_prefixlen: None,
            max_prefixlen: None,
            is_default: false,
            shared: false,
            address_scope_id: None,
        }
    }
}

/// Partial update for a subnet pool. New prefixes must be a superset of the
/// current ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetPoolUpdate {
    pub name: Option<String>,
    pub prefixes: Option<Vec<IpNet>>,
    pub min_prefixlen: Option<u8>,
    pub default_prefixlen: Option<u8>,
    pub max_prefixlen: Option<u8>,
    pub is_default: Option<bool>,
    /// `Some(None)` detaches the pool from its scope.
    pub address_scope_id: Option<Option<AddressScopeId>>,
}

/// Grouping of subnet pools whose prefixes must never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressScope {
    pub id: AddressScopeId,
    pub tenant_id: String,
    pub name: String,
    pub ip_version: IpVersion,
    pub shared: bool,
}

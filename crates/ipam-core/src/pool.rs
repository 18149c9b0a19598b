//! Subnet pool and address scope consistency rules.
//!
//! Pools only ever grow, there is at most one default pool per address
//! family, and pools bound to the same address scope never hold
//! intersecting prefixes.

use ipnet::IpNet;

use vnet_shared_types::{
    AddressScope, IpVersion, IpamError, IpamResult, SubnetPool, SubnetPoolSpec, SubnetPoolUpdate,
    TenantContext,
};

use crate::addr_math;

fn default_min_prefixlen(version: IpVersion) -> u8 {
    match version {
        IpVersion::V4 => 8,
        IpVersion::V6 => 64,
    }
}

/// Build a pool row from a creation request: infer the address family from
/// the prefixes, fill prefix-length defaults, and compact the prefix set.
pub fn build_pool(id: uuid::Uuid, spec: &SubnetPoolSpec) -> IpamResult<SubnetPool> {
    if spec.prefixes.is_empty() {
        return Err(IpamError::invalid_input(
            "a subnet pool needs at least one prefix",
        ));
    }
    let ip_version = IpVersion::of_net(&spec.prefixes[0]);
    if spec
        .prefixes
        .iter()
        .any(|p| IpVersion::of_net(p) != ip_version)
    {
        return Err(IpamError::invalid_input(
            "all pool prefixes must share one address family",
        ));
    }

    let min_prefixlen = spec.min_prefixlen.unwrap_or(default_min_prefixlen(ip_version));
    let max_prefixlen = spec.max_prefixlen.unwrap_or(ip_version.max_prefix_len());
    let default_prefixlen = spec.default_prefixlen.unwrap_or(min_prefixlen);
    check_prefixlen_ordering(ip_version, min_prefixlen, default_prefixlen, max_prefixlen)?;

    Ok(SubnetPool {
        id,
        tenant_id: spec.tenant_id.clone(),
        name: spec.name.clone(),
        ip_version,
        prefixes: addr_math::compact(&spec.prefixes),
        min_prefixlen,
        default_prefixlen,
        max_prefixlen,
        is_default: spec.is_default,
        shared: spec.shared,
        address_scope_id: spec.address_scope_id,
    })
}

/// Derive the post-update pool. Prefixes may only grow: the existing set
/// must be a subset of the new one, otherwise subnets already carved from
/// the pool would be orphaned. Each prefix-length field is converted
/// explicitly and the ordering re-checked against the merged result.
pub fn apply_pool_update(pool: &SubnetPool, update: &SubnetPoolUpdate) -> IpamResult<SubnetPool> {
    let mut updated = pool.clone();
    if let Some(name) = &update.name {
        updated.name = name.clone();
    }
    if let Some(new_prefixes) = &update.prefixes {
        if !addr_math::contains_subset(new_prefixes, &pool.prefixes) {
            return Err(IpamError::conflict(
                "existing prefixes must be a subset of the new prefixes",
            ));
        }
        updated.prefixes = addr_math::compact(new_prefixes);
    }
    if let Some(min) = update.min_prefixlen {
        updated.min_prefixlen = min;
    }
    if let Some(default) = update.default_prefixlen {
        updated.default_prefixlen = default;
    }
    if let Some(max) = update.max_prefixlen {
        updated.max_prefixlen = max;
    }
    check_prefixlen_ordering(
        updated.ip_version,
        updated.min_prefixlen,
        updated.default_prefixlen,
        updated.max_prefixlen,
    )?;
    if let Some(is_default) = update.is_default {
        updated.is_default = is_default;
    }
    if let Some(scope) = update.address_scope_id {
        updated.address_scope_id = scope;
    }
    Ok(updated)
}

fn check_prefixlen_ordering(
    version: IpVersion,
    min: u8,
    default: u8,
    max: u8,
) -> IpamResult<()> {
    if min > default || default > max || max > version.max_prefix_len() {
        return Err(IpamError::invalid_input(format!(
            "prefix length bounds must satisfy min <= default <= max <= {}, got /{} /{} /{}",
            version.max_prefix_len(),
            min,
            default,
            max
        )));
    }
    Ok(())
}

/// Check that the pool may be bound to the scope with the given prefixes.
///
/// The caller must own the scope, or be an admin binding to a shared scope;
/// address families must match; and the prefixes must not intersect those of
/// any other pool already in the scope.
pub fn validate_scope_association(
    ctx: &TenantContext,
    pool_id: uuid::Uuid,
    new_prefixes: &[IpNet],
    pool_version: IpVersion,
    scope: &AddressScope,
    sibling_pools: &[&SubnetPool],
) -> IpamResult<()> {
    if !ctx.owns(&scope.tenant_id) && !(ctx.is_admin && scope.shared) {
        return Err(IpamError::invalid_input(format!(
            "subnet pool {} cannot be associated with address scope {} owned by another tenant",
            pool_id, scope.id
        )));
    }
    if pool_version != scope.ip_version {
        return Err(IpamError::invalid_input(format!(
            "subnet pool {} has ip_version '{}' but address scope {} holds ip_version '{}'",
            pool_id, pool_version, scope.id, scope.ip_version
        )));
    }
    let new_set = addr_math::compact(new_prefixes);
    for sibling in sibling_pools {
        if sibling.id == pool_id {
            continue;
        }
        if addr_math::intersects(&new_set, &sibling.prefixes) {
            return Err(IpamError::conflict(format!(
                "prefixes of pool {} intersect pool {} in address scope {}",
                pool_id, sibling.id, scope.id
            )));
        }
    }
    Ok(())
}

/// A pool under a shared address scope owned by someone else is immutable
/// to the caller.
pub fn check_pool_update_allowed(
    ctx: &TenantContext,
    pool: &SubnetPool,
    scope: &AddressScope,
) -> IpamResult<()> {
    if !ctx.owns(&scope.tenant_id) && !(ctx.is_admin && scope.shared) {
        return Err(IpamError::conflict(format!(
            "subnet pool {} cannot be updated while associated with shared address scope {}",
            pool.id, scope.id
        )));
    }
    Ok(())
}

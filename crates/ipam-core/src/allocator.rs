//! Carves subnet prefixes out of a subnet pool.
//!
//! The allocator itself is pure: it computes over the pool definition and a
//! sibling list read inside the reserving transaction. Two concurrent
//! allocations may both see the same free block; the store's commit-time
//! conflict check aborts one of them and the caller retries.

use ipnet::IpNet;
use log::debug;

use vnet_shared_types::{IpVersion, IpamError, IpamResult, SubnetPool};

use crate::addr_math;

/// What the caller is asking for: a specific prefix or any prefix of the
/// given length. With neither, the pool's default length is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubnetRequest {
    pub cidr: Option<IpNet>,
    pub prefixlen: Option<u8>,
}

impl SubnetRequest {
    pub fn specific(cidr: IpNet) -> Self {
        Self {
            cidr: Some(cidr),
            prefixlen: None,
        }
    }

    pub fn any(prefixlen: u8) -> Self {
        Self {
            cidr: None,
            prefixlen: Some(prefixlen),
        }
    }
}

pub struct SubnetAllocator<'a> {
    pool: &'a SubnetPool,
}

impl<'a> SubnetAllocator<'a> {
    pub fn new(pool: &'a SubnetPool) -> Self {
        Self { pool }
    }

    /// Find and reserve a free, non-overlapping prefix inside the pool.
    ///
    /// `allocated` must be the cidrs of all subnets already carved from this
    /// pool, read inside the same transaction that will persist the result.
    pub fn allocate(&self, request: &SubnetRequest, allocated: &[IpNet]) -> IpamResult<IpNet> {
        let prefixlen = match (request.cidr, request.prefixlen) {
            (Some(_), Some(_)) => {
                return Err(IpamError::invalid_input(
                    "cidr and prefixlen must not be supplied together",
                ))
            }
            (Some(cidr), None) => cidr.prefix_len(),
            (None, Some(len)) => len,
            (None, None) => self.pool.default_prefixlen,
        };
        self.check_prefixlen_bounds(prefixlen)?;

        match request.cidr {
            Some(cidr) => self.allocate_specific(cidr, allocated),
            None => self.allocate_any(prefixlen, allocated),
        }
    }

    fn check_prefixlen_bounds(&self, prefixlen: u8) -> IpamResult<()> {
        if prefixlen < self.pool.min_prefixlen || prefixlen > self.pool.max_prefixlen {
            return Err(IpamError::invalid_input(format!(
                "requested prefix length /{} is outside the pool bounds /{}../{}",
                prefixlen, self.pool.min_prefixlen, self.pool.max_prefixlen
            )));
        }
        Ok(())
    }

    fn allocate_specific(&self, cidr: IpNet, allocated: &[IpNet]) -> IpamResult<IpNet> {
        if IpVersion::of_net(&cidr) != self.pool.ip_version {
            return Err(IpamError::invalid_input(format!(
                "cidr {} does not match the pool's ip_version '{}'",
                cidr, self.pool.ip_version
            )));
        }
        // Pool prefixes are stored compacted, so containment in the union
        // means containment in a single prefix.
        if !self.pool.prefixes.iter().any(|p| p.contains(&cidr)) {
            return Err(IpamError::conflict(format!(
                "cidr {} is not contained in the prefixes of pool {}",
                cidr, self.pool.id
            )));
        }
        if let Some(existing) = allocated.iter().find(|a| addr_math::overlap(a, &cidr)) {
            return Err(IpamError::conflict(format!(
                "cidr {} overlaps subnet {} already allocated from pool {}",
                cidr, existing, self.pool.id
            )));
        }
        Ok(cidr)
    }

    fn allocate_any(&self, prefixlen: u8, allocated: &[IpNet]) -> IpamResult<IpNet> {
        for prefix in &self.pool.prefixes {
            if let Some(found) = first_fit(*prefix, prefixlen, allocated) {
                debug!(
                    "allocated {} (/{} requested) from pool {}",
                    found, prefixlen, self.pool.id
                );
                return Ok(found);
            }
        }
        Err(IpamError::ResourceExhausted {
            pool_id: self.pool.id,
            prefix_len: prefixlen,
        })
    }
}

/// First free block of the requested length inside `block`, in ascending
/// address order. Splits the block in halves only where an existing
/// allocation forces it, so the search is bounded by the number of
/// allocations times the prefix length, not by the address space.
fn first_fit(block: IpNet, prefixlen: u8, allocated: &[IpNet]) -> Option<IpNet> {
    if block.prefix_len() > prefixlen {
        return None;
    }
    let blocked: Vec<&IpNet> = allocated
        .iter()
        .filter(|a| addr_math::overlap(a, &block))
        .collect();
    if blocked.is_empty() {
        // The block start is aligned for any longer prefix length.
        return IpNet::new(block.network(), prefixlen).ok();
    }
    if block.prefix_len() == prefixlen {
        return None;
    }
    let halves: Vec<IpNet> = block
        .subnets(block.prefix_len() + 1)
        .ok()?
        .collect();
    for half in halves {
        if let Some(found) = first_fit(half, prefixlen, allocated) {
            return Some(found);
        }
    }
    None
}

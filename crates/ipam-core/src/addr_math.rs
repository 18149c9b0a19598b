//! Pure numeric operations over IP prefixes and address ranges.
//!
//! Everything in here is stateless; the only failure mode is malformed
//! input.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use vnet_shared_types::{AllocationPool, IpVersion, IpamError, IpamResult};

/// Parse CIDR notation. Non-canonical prefixes (host bits set) are rejected
/// rather than silently truncated.
pub fn parse_prefix(text: &str) -> IpamResult<IpNet> {
    let net: IpNet = text
        .parse()
        .map_err(|_| IpamError::invalid_input(format!("'{}' is not a valid CIDR", text)))?;
    if net != net.trunc() {
        return Err(IpamError::invalid_input(format!(
            "'{}' is not a canonical CIDR, expected '{}'",
            text,
            net.trunc()
        )));
    }
    Ok(net)
}

/// Merge adjacent and overlapping prefixes into the minimal covering set,
/// ordered ascending.
pub fn compact(prefixes: &[IpNet]) -> Vec<IpNet> {
    let mut merged = IpNet::aggregate(&prefixes.to_vec());
    merged.sort();
    merged
}

/// True iff two prefixes share at least one address.
pub fn overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// True iff every address covered by `b` is also covered by `a`.
pub fn contains_subset(a: &[IpNet], b: &[IpNet]) -> bool {
    let mut union: Vec<IpNet> = a.to_vec();
    union.extend_from_slice(b);
    compact(&union) == compact(a)
}

/// True iff the unions of the two sets share at least one address.
pub fn intersects(a: &[IpNet], b: &[IpNet]) -> bool {
    a.iter().any(|x| b.iter().any(|y| overlap(x, y)))
}

/// Generate the default allocation pools for a subnet: the usable host range
/// of the cidr, split around the gateway if it falls inside. IPv4 excludes
/// the network and broadcast addresses, IPv6 only the network address.
pub fn range_from_cidr_excluding(cidr: &IpNet, gateway: Option<IpAddr>) -> Vec<AllocationPool> {
    let version = IpVersion::of_net(cidr);
    let first = match ip_to_u128(&cidr.network()).checked_add(1) {
        Some(v) => v,
        None => return Vec::new(),
    };
    let last_addr = ip_to_u128(&cidr.broadcast());
    let last = match version {
        IpVersion::V4 => match last_addr.checked_sub(1) {
            Some(v) => v,
            None => return Vec::new(),
        },
        IpVersion::V6 => last_addr,
    };
    if first > last {
        return Vec::new();
    }

    let mut pools = Vec::new();
    match gateway.map(|gw| ip_to_u128(&gw)) {
        Some(gw) if gw >= first && gw <= last => {
            if gw > first {
                pools.push(pool_from_u128(first, gw - 1, version));
            }
            if gw < last {
                pools.push(pool_from_u128(gw + 1, last, version));
            }
        }
        _ => pools.push(pool_from_u128(first, last, version)),
    }
    pools
}

/// Whether a gateway address is unusable within its subnet: the network
/// address, or for IPv4 the broadcast address. Addresses outside the subnet
/// are considered valid (external gateways).
pub fn gateway_invalid_in_subnet(cidr: &IpNet, gateway: &IpAddr) -> bool {
    if !cidr.contains(gateway) {
        return false;
    }
    match cidr {
        IpNet::V4(_) => *gateway == cidr.network() || *gateway == cidr.broadcast(),
        IpNet::V6(_) => *gateway == cidr.network(),
    }
}

/// First usable host address of a prefix, used when renumbering assigns a
/// fresh gateway.
pub fn first_host(cidr: &IpNet) -> IpAddr {
    let version = IpVersion::of_net(cidr);
    if cidr.prefix_len() >= version.max_prefix_len() - 1 {
        return cidr.network();
    }
    u128_to_ip(ip_to_u128(&cidr.network()) + 1, version)
}

pub(crate) fn ip_to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

pub(crate) fn u128_to_ip(value: u128, version: IpVersion) -> IpAddr {
    match version {
        IpVersion::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpVersion::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

fn pool_from_u128(start: u128, end: u128, version: IpVersion) -> AllocationPool {
    AllocationPool::new(u128_to_ip(start, version), u128_to_ip(end, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(texts: &[&str]) -> Vec<IpNet> {
        texts.iter().map(|t| t.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_prefix_rejects_non_canonical() {
        assert!(parse_prefix("10.0.0.0/24").is_ok());
        assert!(parse_prefix("2001:db8::/64").is_ok());
        assert!(parse_prefix("10.0.0.1/24").is_err());
        assert!(parse_prefix("10.0.0.0").is_err());
        assert!(parse_prefix("not-a-cidr").is_err());
    }

    #[test]
    fn test_compact_merges_siblings_and_sorts() {
        let merged = compact(&nets(&["10.0.1.0/24", "10.0.0.0/24", "10.1.0.0/16"]));
        assert_eq!(merged, nets(&["10.0.0.0/23", "10.1.0.0/16"]));
    }

    #[test]
    fn test_compact_covers_same_addresses() {
        // Two independently compacted sets, merged, stay free of adjacent or
        // overlapping entries.
        let p1 = compact(&nets(&["10.0.0.0/25", "10.0.0.128/25"]));
        let p2 = compact(&nets(&["10.0.1.0/24"]));
        let mut union = p1.clone();
        union.extend(p2.clone());
        let merged = compact(&union);
        assert_eq!(merged, nets(&["10.0.0.0/23"]));
        for pair in merged.windows(2) {
            assert!(!overlap(&pair[0], &pair[1]));
        }
        assert!(contains_subset(&merged, &p1));
        assert!(contains_subset(&merged, &p2));
    }

    #[test]
    fn test_contains_subset() {
        let a = nets(&["10.0.0.0/16"]);
        assert!(contains_subset(&a, &nets(&["10.0.3.0/24"])));
        assert!(contains_subset(&a, &nets(&["10.0.0.0/16"])));
        assert!(!contains_subset(&a, &nets(&["10.1.0.0/24"])));
        // Coverage assembled from two halves.
        let halves = nets(&["10.0.0.0/25", "10.0.0.128/25"]);
        assert!(contains_subset(&halves, &nets(&["10.0.0.0/24"])));
    }

    #[test]
    fn test_intersects() {
        assert!(intersects(
            &nets(&["10.0.0.0/16"]),
            &nets(&["10.0.200.0/24"])
        ));
        assert!(!intersects(&nets(&["10.0.0.0/16"]), &nets(&["10.1.0.0/16"])));
        // Families never intersect.
        assert!(!intersects(
            &nets(&["10.0.0.0/8"]),
            &nets(&["2001:db8::/32"])
        ));
    }

    #[test]
    fn test_default_pools_exclude_network_and_broadcast() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let pools = range_from_cidr_excluding(&cidr, None);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].start, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pools[0].end, "10.0.0.254".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_default_pools_split_around_gateway() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();

        // Gateway at the first host leaves a single upper segment.
        let pools = range_from_cidr_excluding(&cidr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].start, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(pools[0].end, "10.0.0.254".parse::<IpAddr>().unwrap());

        // A mid-range gateway splits the range in two.
        let pools = range_from_cidr_excluding(&cidr, Some("10.0.0.100".parse().unwrap()));
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].end, "10.0.0.99".parse::<IpAddr>().unwrap());
        assert_eq!(pools[1].start, "10.0.0.101".parse::<IpAddr>().unwrap());

        // A gateway outside the subnet does not split anything.
        let pools = range_from_cidr_excluding(&cidr, Some("192.168.0.1".parse().unwrap()));
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn test_default_pools_v6_keep_last_address() {
        let cidr: IpNet = "2001:db8::/64".parse().unwrap();
        let pools = range_from_cidr_excluding(&cidr, None);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].start, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(
            pools[0].end,
            "2001:db8::ffff:ffff:ffff:ffff".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_tiny_prefixes_yield_no_pools() {
        let p32: IpNet = "10.0.0.1/32".parse().unwrap();
        assert!(range_from_cidr_excluding(&p32, None).is_empty());
        let p31: IpNet = "10.0.0.0/31".parse().unwrap();
        assert!(range_from_cidr_excluding(&p31, None).is_empty());
    }

    #[test]
    fn test_gateway_invalid_in_subnet() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(gateway_invalid_in_subnet(
            &cidr,
            &"10.0.0.0".parse().unwrap()
        ));
        assert!(gateway_invalid_in_subnet(
            &cidr,
            &"10.0.0.255".parse().unwrap()
        ));
        assert!(!gateway_invalid_in_subnet(
            &cidr,
            &"10.0.0.1".parse().unwrap()
        ));
        // External gateway is fine.
        assert!(!gateway_invalid_in_subnet(
            &cidr,
            &"192.168.0.1".parse().unwrap()
        ));

        let v6: IpNet = "2001:db8::/64".parse().unwrap();
        assert!(gateway_invalid_in_subnet(&v6, &"2001:db8::".parse().unwrap()));
        assert!(!gateway_invalid_in_subnet(
            &v6,
            &"2001:db8::1".parse().unwrap()
        ));
    }

    #[test]
    fn test_first_host() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(first_host(&cidr), "10.0.0.1".parse::<IpAddr>().unwrap());
        let v6: IpNet = "2001:db8::/64".parse().unwrap();
        assert_eq!(first_host(&v6), "2001:db8::1".parse::<IpAddr>().unwrap());
    }
}

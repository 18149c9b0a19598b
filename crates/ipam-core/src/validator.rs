//! Stateless rule engine for subnet specs.
//!
//! Validation runs before any mutation is attempted: a spec that fails here
//! never reaches the allocator or the store. For updates the pre-existing
//! subnet is passed in so the rules that depend on the old state (DHCP
//! transitions, gateway in use) can be applied; the validator itself never
//! consults the store.

use std::net::IpAddr;

use ipnet::IpNet;

use vnet_shared_types::{
    AllocationPool, IpVersion, IpamError, IpamResult, Ipv6Mode, PortId, Subnet, SubnetSpec,
};

use crate::addr_math;
use crate::config::IpamLimits;

/// State of the pre-existing subnet an update is validated against.
pub struct CurrentSubnet<'a> {
    pub subnet: &'a Subnet,
    /// Router port bound to the old gateway address, if any. Resolved by the
    /// caller through the port directory before validation.
    pub gateway_port: Option<PortId>,
}

#[derive(Debug, Clone)]
pub struct SubnetValidator {
    limits: IpamLimits,
}

impl SubnetValidator {
    pub fn new(limits: IpamLimits) -> Self {
        Self { limits }
    }

    /// Validate a subnet spec for creation (`cur` is `None`) or update.
    ///
    /// The first violated rule determines the error. The spec's `cidr` may
    /// be unset when the prefix will be carved from a pool later; rules that
    /// need the cidr are re-run once it is known.
    pub fn validate(&self, spec: &SubnetSpec, cur: Option<&CurrentSubnet>) -> IpamResult<()> {
        if let Some(cidr) = &spec.cidr {
            self.check_ip_version(spec.ip_version, IpVersion::of_net(cidr), "cidr")?;
        }

        self.validate_dhcp_enable(spec, cur)?;
        self.validate_gateway(spec, cur)?;
        self.validate_dns_nameservers(spec)?;
        self.validate_host_routes(spec)?;

        match spec.ip_version {
            IpVersion::V4 => {
                if spec.ipv6_ra_mode.is_some() {
                    return Err(IpamError::invalid_input(
                        "ipv6_ra_mode is not valid when ip_version is 4",
                    ));
                }
                if spec.ipv6_address_mode.is_some() {
                    return Err(IpamError::invalid_input(
                        "ipv6_address_mode is not valid when ip_version is 4",
                    ));
                }
            }
            IpVersion::V6 => self.validate_ipv6_modes(spec, cur)?,
        }
        Ok(())
    }

    /// Additional constraints when the prefix comes from upstream delegation
    /// instead of a local pool.
    pub fn validate_for_prefix_delegation(&self, spec: &SubnetSpec) -> IpamResult<()> {
        if spec.ip_version != IpVersion::V6 {
            return Err(IpamError::invalid_input(
                "prefix delegation can only be used with IPv6 subnets",
            ));
        }
        let delegable = |mode: Option<Ipv6Mode>| {
            matches!(mode, Some(Ipv6Mode::Slaac) | Some(Ipv6Mode::Dhcpv6Stateless))
        };
        if !delegable(spec.ipv6_ra_mode) {
            return Err(IpamError::invalid_input(
                "ipv6_ra_mode must be slaac or dhcpv6-stateless for prefix delegation",
            ));
        }
        if !delegable(spec.ipv6_address_mode) {
            return Err(IpamError::invalid_input(
                "ipv6_address_mode must be slaac or dhcpv6-stateless for prefix delegation",
            ));
        }
        Ok(())
    }

    fn check_ip_version(&self, expected: IpVersion, actual: IpVersion, name: &str) -> IpamResult<()> {
        if expected != actual {
            return Err(IpamError::invalid_input(format!(
                "{} does not match the ip_version '{}'",
                name, expected
            )));
        }
        Ok(())
    }

    fn validate_dhcp_enable(&self, spec: &SubnetSpec, cur: Option<&CurrentSubnet>) -> IpamResult<()> {
        let dhcp_was_enabled = cur.map_or(false, |c| c.subnet.enable_dhcp);
        if !spec.enable_dhcp || dhcp_was_enabled {
            return Ok(());
        }
        let cidr = match &spec.cidr {
            Some(cidr) => cidr,
            None => return Ok(()),
        };
        let too_small = match spec.ip_version {
            IpVersion::V4 => cidr.prefix_len() > 30,
            IpVersion::V6 => cidr.prefix_len() > 126,
        };
        if too_small {
            return Err(IpamError::invalid_input(
                "subnet has a prefix length that is incompatible with DHCP service enabled",
            ));
        }
        let network = cidr.network();
        let multicast = match network {
            IpAddr::V4(v4) => v4.is_multicast(),
            IpAddr::V6(v6) => v6.is_multicast(),
        };
        if multicast {
            return Err(IpamError::invalid_input(
                "multicast IP subnet is not supported if enable_dhcp is true",
            ));
        }
        let loopback = match network {
            IpAddr::V4(v4) => v4.is_loopback(),
            IpAddr::V6(v6) => v6.is_loopback(),
        };
        if loopback {
            return Err(IpamError::invalid_input(
                "loopback IP subnet is not supported if enable_dhcp is true",
            ));
        }
        Ok(())
    }

    fn validate_gateway(&self, spec: &SubnetSpec, cur: Option<&CurrentSubnet>) -> IpamResult<()> {
        let gateway = match &spec.gateway_ip {
            Some(gateway) => gateway,
            None => return Ok(()),
        };
        self.check_ip_version(spec.ip_version, IpVersion::of_addr(gateway), "gateway_ip")?;
        if let Some(cidr) = &spec.cidr {
            if addr_math::gateway_invalid_in_subnet(cidr, gateway) {
                return Err(IpamError::invalid_input("gateway is not valid on subnet"));
            }
        }
        // On update the old gateway must not be held by a router port. There
        // is a slight race with a concurrent router-interface-add; the store
        // conflict check closes it for entities the core owns.
        if let Some(cur) = cur {
            if !spec.is_prefix_delegation() {
                if let Some(port_id) = cur.gateway_port {
                    return Err(IpamError::in_use(format!(
                        "gateway ip {} is in use by port {}",
                        cur.subnet
                            .gateway_ip
                            .map(|ip| ip.to_string())
                            .unwrap_or_default(),
                        port_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_dns_nameservers(&self, spec: &SubnetSpec) -> IpamResult<()> {
        if spec.dns_nameservers.len() > self.limits.max_dns_nameservers {
            return Err(IpamError::invalid_input(format!(
                "subnet allows at most {} dns nameservers",
                self.limits.max_dns_nameservers
            )));
        }
        for dns in &spec.dns_nameservers {
            self.check_ip_version(spec.ip_version, IpVersion::of_addr(dns), "dns_nameserver")?;
        }
        Ok(())
    }

    fn validate_host_routes(&self, spec: &SubnetSpec) -> IpamResult<()> {
        if spec.host_routes.len() > self.limits.max_subnet_host_routes {
            return Err(IpamError::invalid_input(format!(
                "subnet allows at most {} host routes",
                self.limits.max_subnet_host_routes
            )));
        }
        for route in &spec.host_routes {
            self.check_ip_version(
                spec.ip_version,
                IpVersion::of_net(&route.destination),
                "destination",
            )?;
            self.check_ip_version(spec.ip_version, IpVersion::of_addr(&route.nexthop), "nexthop")?;
        }
        Ok(())
    }

    fn validate_ipv6_modes(&self, spec: &SubnetSpec, cur: Option<&CurrentSubnet>) -> IpamResult<()> {
        if let Some(cur) = cur {
            return self.validate_ipv6_update_dhcp(spec, cur.subnet);
        }

        let ra_set = spec.ipv6_ra_mode.is_some();
        let addr_set = spec.ipv6_address_mode.is_some();
        if (ra_set || addr_set) && !spec.enable_dhcp {
            return Err(IpamError::invalid_input(
                "ipv6_ra_mode or ipv6_address_mode cannot be set when enable_dhcp is false",
            ));
        }
        if let (Some(ra_mode), Some(addr_mode)) = (spec.ipv6_ra_mode, spec.ipv6_address_mode) {
            if ra_mode != addr_mode {
                return Err(IpamError::invalid_input(format!(
                    "ipv6_ra_mode '{}' conflicts with ipv6_address_mode '{}', both must be the \
                     same value when set",
                    ra_mode, addr_mode
                )));
            }
        }
        if (ra_set || addr_set) && spec.is_auto_address() {
            // EUI-64 interface ids leave exactly 64 bits for the prefix.
            if let Some(cidr) = &spec.cidr {
                if cidr.prefix_len() != 64 {
                    return Err(IpamError::invalid_input(format!(
                        "invalid CIDR {} for IPv6 address mode, auto-addressing requires a /64 \
                         prefix",
                        cidr
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_ipv6_update_dhcp(&self, spec: &SubnetSpec, cur: &Subnet) -> IpamResult<()> {
        if spec.enable_dhcp {
            return Ok(());
        }
        let spec_modes_set = spec.ipv6_ra_mode.is_some() || spec.ipv6_address_mode.is_some();
        let cur_modes_set = cur.ipv6_ra_mode.is_some() || cur.ipv6_address_mode.is_some();
        if spec_modes_set || cur_modes_set {
            return Err(IpamError::invalid_input(
                "cannot disable enable_dhcp with ipv6 attributes set",
            ));
        }
        Ok(())
    }
}

/// Check explicit allocation pools against the subnet cidr: each range must
/// be well-formed, contained in the cidr, and the set pairwise disjoint.
/// Returns the pools sorted ascending.
pub fn validate_allocation_pools(
    pools: &[AllocationPool],
    cidr: &IpNet,
) -> IpamResult<Vec<AllocationPool>> {
    let version = IpVersion::of_net(cidr);
    for pool in pools {
        if IpVersion::of_addr(&pool.start) != version || IpVersion::of_addr(&pool.end) != version {
            return Err(IpamError::invalid_input(format!(
                "allocation pool {} does not match the subnet address family",
                pool
            )));
        }
        if pool.start > pool.end {
            return Err(IpamError::invalid_input(format!(
                "allocation pool {} has its start after its end",
                pool
            )));
        }
        if !cidr.contains(&pool.start) || !cidr.contains(&pool.end) {
            return Err(IpamError::invalid_input(format!(
                "allocation pool {} is not contained in subnet cidr {}",
                pool, cidr
            )));
        }
    }
    let mut sorted: Vec<AllocationPool> = pools.to_vec();
    sorted.sort_by_key(|p| p.start);
    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(IpamError::conflict(format!(
                "allocation pools {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(sorted)
}

/// The gateway must not fall inside any allocation pool.
pub fn validate_gateway_out_of_pools(
    gateway: &IpAddr,
    pools: &[AllocationPool],
) -> IpamResult<()> {
    for pool in pools {
        if pool.contains(gateway) {
            return Err(IpamError::conflict(format!(
                "gateway ip {} conflicts with allocation pool {}",
                gateway, pool
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vnet_shared_types::HostRoute;

    fn validator() -> SubnetValidator {
        SubnetValidator::new(IpamLimits::default())
    }

    fn v4_spec(cidr: &str) -> SubnetSpec {
        SubnetSpec::new(Uuid::new_v4(), "t1", IpVersion::V4).with_cidr(cidr.parse().unwrap())
    }

    fn v6_spec(cidr: &str) -> SubnetSpec {
        SubnetSpec::new(Uuid::new_v4(), "t1", IpVersion::V6).with_cidr(cidr.parse().unwrap())
    }

    fn existing(spec: &SubnetSpec) -> Subnet {
        Subnet {
            id: Uuid::new_v4(),
            network_id: spec.network_id,
            tenant_id: spec.tenant_id.clone(),
            name: spec.name.clone(),
            ip_version: spec.ip_version,
            cidr: spec.cidr.unwrap(),
            gateway_ip: spec.gateway_ip,
            enable_dhcp: spec.enable_dhcp,
            allocation_pools: vec![],
            host_routes: vec![],
            dns_nameservers: vec![],
            ipv6_ra_mode: spec.ipv6_ra_mode,
            ipv6_address_mode: spec.ipv6_address_mode,
            subnetpool: None,
        }
    }

    #[test]
    fn test_cidr_family_must_match_ip_version() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.cidr = Some("2001:db8::/64".parse().unwrap());
        assert!(matches!(
            validator().validate(&spec, None),
            Err(IpamError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dhcp_prefix_length_limits() {
        let mut spec = v4_spec("10.0.0.0/31");
        spec.enable_dhcp = true;
        assert!(validator().validate(&spec, None).is_err());

        let mut spec = v4_spec("10.0.0.0/30");
        spec.enable_dhcp = true;
        assert!(validator().validate(&spec, None).is_ok());

        let mut spec = v6_spec("2001:db8::/127");
        spec.enable_dhcp = true;
        assert!(validator().validate(&spec, None).is_err());
    }

    #[test]
    fn test_dhcp_rejects_multicast_and_loopback() {
        let mut spec = v4_spec("224.0.0.0/24");
        spec.enable_dhcp = true;
        assert!(validator().validate(&spec, None).is_err());

        let mut spec = v4_spec("127.0.0.0/24");
        spec.enable_dhcp = true;
        assert!(validator().validate(&spec, None).is_err());

        // Without DHCP the same prefixes pass.
        let spec = v4_spec("224.0.0.0/24");
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_dhcp_rules_skipped_when_already_enabled() {
        let mut spec = v4_spec("10.0.0.0/31");
        spec.enable_dhcp = true;
        let mut cur = existing(&spec);
        cur.enable_dhcp = true;
        let cur = CurrentSubnet {
            subnet: &cur,
            gateway_port: None,
        };
        assert!(validator().validate(&spec, Some(&cur)).is_ok());
    }

    #[test]
    fn test_gateway_rules() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.gateway_ip = Some("10.0.0.255".parse().unwrap());
        assert!(validator().validate(&spec, None).is_err());

        spec.gateway_ip = Some("2001:db8::1".parse().unwrap());
        assert!(validator().validate(&spec, None).is_err());

        spec.gateway_ip = Some("10.0.0.1".parse().unwrap());
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_gateway_in_use_by_router_port() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.gateway_ip = Some("10.0.0.2".parse().unwrap());
        let mut cur = existing(&spec);
        cur.gateway_ip = Some("10.0.0.1".parse().unwrap());
        let cur = CurrentSubnet {
            subnet: &cur,
            gateway_port: Some(Uuid::new_v4()),
        };
        assert!(matches!(
            validator().validate(&spec, Some(&cur)),
            Err(IpamError::ResourceInUse(_))
        ));
    }

    #[test]
    fn test_dns_nameserver_limits_and_family() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.dns_nameservers = vec!["8.8.8.8".parse().unwrap(); 6];
        assert!(validator().validate(&spec, None).is_err());

        spec.dns_nameservers = vec!["2001:4860::8888".parse().unwrap()];
        assert!(validator().validate(&spec, None).is_err());

        spec.dns_nameservers = vec!["8.8.8.8".parse().unwrap()];
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_host_route_family() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.host_routes = vec![HostRoute {
            destination: "2001:db8::/64".parse().unwrap(),
            nexthop: "10.0.0.1".parse().unwrap(),
        }];
        assert!(validator().validate(&spec, None).is_err());

        spec.host_routes = vec![HostRoute {
            destination: "192.168.0.0/24".parse().unwrap(),
            nexthop: "10.0.0.1".parse().unwrap(),
        }];
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_v4_rejects_ipv6_modes() {
        let mut spec = v4_spec("10.0.0.0/24");
        spec.ipv6_ra_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate(&spec, None).is_err());
    }

    #[test]
    fn test_ipv6_mode_combinations() {
        // Modes require DHCP.
        let mut spec = v6_spec("2001:db8::/64");
        spec.ipv6_address_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate(&spec, None).is_err());

        // Differing modes are rejected.
        spec.enable_dhcp = true;
        spec.ipv6_ra_mode = Some(Ipv6Mode::Dhcpv6Stateful);
        assert!(validator().validate(&spec, None).is_err());

        // Matching modes pass.
        spec.ipv6_ra_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_slaac_requires_64_prefix() {
        let mut spec = v6_spec("2001:db8::/80");
        spec.enable_dhcp = true;
        spec.ipv6_address_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate(&spec, None).is_err());

        let mut spec = v6_spec("2001:db8::/64");
        spec.enable_dhcp = true;
        spec.ipv6_address_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate(&spec, None).is_ok());

        // Stateful assignment has no prefix constraint.
        let mut spec = v6_spec("2001:db8::/80");
        spec.enable_dhcp = true;
        spec.ipv6_address_mode = Some(Ipv6Mode::Dhcpv6Stateful);
        assert!(validator().validate(&spec, None).is_ok());
    }

    #[test]
    fn test_disable_dhcp_with_modes_rejected() {
        let mut create = v6_spec("2001:db8::/64");
        create.enable_dhcp = true;
        create.ipv6_address_mode = Some(Ipv6Mode::Slaac);
        create.ipv6_ra_mode = Some(Ipv6Mode::Slaac);
        let cur = existing(&create);

        let mut update = create.clone();
        update.enable_dhcp = false;
        let cur_view = CurrentSubnet {
            subnet: &cur,
            gateway_port: None,
        };
        assert!(validator().validate(&update, Some(&cur_view)).is_err());
    }

    #[test]
    fn test_prefix_delegation_spec() {
        let mut spec = v6_spec("::/64");
        spec.enable_dhcp = true;
        spec.ipv6_ra_mode = Some(Ipv6Mode::Slaac);
        spec.ipv6_address_mode = Some(Ipv6Mode::Slaac);
        assert!(validator().validate_for_prefix_delegation(&spec).is_ok());

        spec.ipv6_ra_mode = Some(Ipv6Mode::Dhcpv6Stateful);
        assert!(validator().validate_for_prefix_delegation(&spec).is_err());

        let v4 = v4_spec("10.0.0.0/24");
        assert!(validator().validate_for_prefix_delegation(&v4).is_err());
    }

    #[test]
    fn test_allocation_pool_validation() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let pools = vec![
            AllocationPool::new("10.0.0.100".parse().unwrap(), "10.0.0.200".parse().unwrap()),
            AllocationPool::new("10.0.0.2".parse().unwrap(), "10.0.0.50".parse().unwrap()),
        ];
        let sorted = validate_allocation_pools(&pools, &cidr).unwrap();
        assert_eq!(sorted[0].start, "10.0.0.2".parse::<IpAddr>().unwrap());

        // Overlapping ranges are a conflict.
        let overlapping = vec![
            AllocationPool::new("10.0.0.2".parse().unwrap(), "10.0.0.100".parse().unwrap()),
            AllocationPool::new("10.0.0.50".parse().unwrap(), "10.0.0.200".parse().unwrap()),
        ];
        assert!(matches!(
            validate_allocation_pools(&overlapping, &cidr),
            Err(IpamError::Conflict(_))
        ));

        // Out-of-cidr ranges are invalid input.
        let outside = vec![AllocationPool::new(
            "10.0.1.2".parse().unwrap(),
            "10.0.1.5".parse().unwrap(),
        )];
        assert!(matches!(
            validate_allocation_pools(&outside, &cidr),
            Err(IpamError::InvalidInput(_))
        ));

        // Gateway inside a pool is a conflict.
        let gw: IpAddr = "10.0.0.10".parse().unwrap();
        assert!(validate_gateway_out_of_pools(&gw, &sorted).is_err());
        let gw: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(validate_gateway_out_of_pools(&gw, &sorted).is_ok());
    }
}

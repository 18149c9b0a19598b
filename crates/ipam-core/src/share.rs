//! Tenant-sharing consistency rules.
//!
//! A network's shared access may only be revoked while no foreign tenant
//! still depends on it. The checker is pure; [`ShareGuard`] wires it to the
//! event bus so that a grant revocation is vetoed before it commits.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use vnet_event_bus::EventListener;
use vnet_shared_types::{
    device_owner, AccessGrant, IpamError, IpamEvent, IpamResult, Network, Port, Subnet,
    WILDCARD_TENANT,
};
use vnet_store::{MemoryStore, PortDirectory};

pub struct ShareConsistencyChecker;

impl ShareConsistencyChecker {
    /// Check whether the grant for `target_tenant` can be revoked from the
    /// network.
    ///
    /// Revoking the wildcard grant scans every port not owned by network
    /// infrastructure plus every subnet: if more than one tenant is
    /// represented, or the one remaining tenant is not the network owner,
    /// the network is still in use. Revoking a specific tenant's grant is
    /// allowed as long as a wildcard grant remains, otherwise every port
    /// must belong to a tenant still covered by a remaining grant or to the
    /// owner.
    pub fn can_revoke_share(
        network: &Network,
        remaining_grants: &[&AccessGrant],
        ports: &[Port],
        subnets: &[&Subnet],
        target_tenant: &str,
    ) -> IpamResult<()> {
        if target_tenant == WILDCARD_TENANT {
            return Self::check_only_owner_remains(network, ports, subnets);
        }

        if remaining_grants
            .iter()
            .any(|g| g.target_tenant == WILDCARD_TENANT)
        {
            // A wildcard covers any remaining tenant.
            return Ok(());
        }

        let allowed: HashSet<&str> = remaining_grants
            .iter()
            .map(|g| g.target_tenant.as_str())
            .chain(std::iter::once(network.tenant_id.as_str()))
            .collect();
        if let Some(port) = ports.iter().find(|p| !allowed.contains(p.tenant_id.as_str())) {
            return Err(IpamError::in_use(format!(
                "unable to revoke access to network {}: port {} of tenant {} depends on it",
                network.id, port.id, port.tenant_id
            )));
        }
        Ok(())
    }

    /// Check the `shared` true-to-false transition of a network.
    pub fn validate_shared_update(
        network: &Network,
        was_shared: bool,
        now_shared: bool,
        ports: &[Port],
        subnets: &[&Subnet],
    ) -> IpamResult<()> {
        if now_shared || !was_shared {
            return Ok(());
        }
        Self::check_only_owner_remains(network, ports, subnets)
    }

    fn check_only_owner_remains(
        network: &Network,
        ports: &[Port],
        subnets: &[&Subnet],
    ) -> IpamResult<()> {
        let tenants: HashSet<&str> = ports
            .iter()
            .filter(|p| !device_owner::is_network_owned(&p.device_owner))
            .map(|p| p.tenant_id.as_str())
            .chain(subnets.iter().map(|s| s.tenant_id.as_str()))
            .collect();
        let foreign = tenants.len() > 1
            || tenants
                .iter()
                .next()
                .map_or(false, |t| *t != network.tenant_id);
        if foreign {
            return Err(IpamError::in_use(format!(
                "unable to stop sharing network {}: resources of other tenants depend on it",
                network.id
            )));
        }
        Ok(())
    }
}

/// Event-bus listener that vetoes an access-grant revocation while foreign
/// tenants still hold resources on the network.
pub struct ShareGuard {
    store: MemoryStore,
    ports: Arc<dyn PortDirectory>,
}

impl ShareGuard {
    pub fn new(store: MemoryStore, ports: Arc<dyn PortDirectory>) -> Self {
        Self { store, ports }
    }
}

#[async_trait]
impl EventListener for ShareGuard {
    async fn on_event(&self, event: &IpamEvent) -> anyhow::Result<()> {
        let (network_id, target_tenant) = match event {
            IpamEvent::NetworkAccessBeforeRevoke {
                network_id,
                target_tenant,
            } => (*network_id, target_tenant.clone()),
            _ => return Ok(()),
        };

        let (network, remaining, subnets) = self.store.read(|state| {
            let network = state.network(network_id).cloned();
            let remaining: Vec<AccessGrant> = state
                .grants_on_network(network_id)
                .into_iter()
                .filter(|g| g.target_tenant != target_tenant)
                .cloned()
                .collect();
            let subnets: Vec<Subnet> = state
                .subnets_on_network(network_id)
                .into_iter()
                .cloned()
                .collect();
            (network, remaining, subnets)
        })
        .await;
        let network = network?;
        let ports = self.ports.ports_on_network(network_id).await?;

        let remaining_refs: Vec<&AccessGrant> = remaining.iter().collect();
        let subnet_refs: Vec<&Subnet> = subnets.iter().collect();
        ShareConsistencyChecker::can_revoke_share(
            &network,
            &remaining_refs,
            &ports,
            &subnet_refs,
            &target_tenant,
        )?;
        Ok(())
    }
}

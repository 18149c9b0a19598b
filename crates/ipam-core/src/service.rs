//! Orchestration of subnet, pool and scope lifecycles.
//!
//! Every mutation follows the same shape: resolve and validate against a
//! fresh read, announce guarded BEFORE events, commit in one store
//! transaction, then run post-commit side effects and AFTER events. A
//! transaction that loses the optimistic-commit race fails with
//! [`IpamError::TransientStoreConflict`] and the whole operation is re-run
//! from validation onward, up to the configured retry limit.

use std::collections::HashSet;
use std::sync::Arc;

use ipnet::IpNet;
use log::{debug, info, warn};
use uuid::Uuid;

use vnet_event_bus::{EventBus, EventBusError};
use vnet_shared_types::{
    device_owner, AccessGrant, AddressScope, AddressScopeId, FixedIp, IpVersion, IpamError,
    IpamEvent, IpamResult, Network, NetworkId, Port, PortId, PortPatch, RouterId, RouterRef,
    Subnet, SubnetId,
    SubnetPool, SubnetPoolId, SubnetPoolRef, SubnetPoolSpec, SubnetPoolUpdate, SubnetSpec,
    SubnetUpdate, TenantContext, WILDCARD_TENANT, PROVISIONAL_V6_PD_CIDR,
};
use vnet_store::{MemoryStore, PortDirectory, RouterService};

use crate::addr_math;
use crate::allocator::{SubnetAllocator, SubnetRequest};
use crate::config::IpamLimits;
use crate::pool as pool_rules;
use crate::share::ShareGuard;
use crate::validator::{
    validate_allocation_pools, validate_gateway_out_of_pools, CurrentSubnet, SubnetValidator,
};

/// Where a new subnet's prefix comes from.
enum PrefixSource {
    Explicit(IpNet),
    FromPool(SubnetPoolId),
    Delegated,
}

/// Side effects of a committed subnet update, applied after the transaction.
struct SubnetUpdateEffects {
    gateway_changed: bool,
    renumbered: bool,
}

pub struct IpamService {
    store: MemoryStore,
    ports: Arc<dyn PortDirectory>,
    routers: Option<Arc<dyn RouterService>>,
    events: EventBus,
    limits: IpamLimits,
    validator: SubnetValidator,
}

impl IpamService {
    pub async fn new(
        store: MemoryStore,
        ports: Arc<dyn PortDirectory>,
        routers: Option<Arc<dyn RouterService>>,
        limits: IpamLimits,
    ) -> Self {
        let events = EventBus::new();
        let guard = ShareGuard::new(store.clone(), Arc::clone(&ports));
        // The bus is freshly created, the name cannot collide.
        let _ = events.register_listener("share-guard", guard).await;
        let validator = SubnetValidator::new(limits.clone());
        Self {
            store,
            ports,
            routers,
            events,
            limits,
            validator,
        }
    }

    /// Bus on which collaborating services register their listeners.
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    // ---- networks and access grants ----

    pub async fn create_network(
        &self,
        ctx: &TenantContext,
        name: &str,
        external: bool,
    ) -> IpamResult<Network> {
        let network = Network {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id.clone(),
            name: name.to_string(),
            shared: false,
            external,
        };
        let row = network.clone();
        self.store
            .in_transaction(move |state| {
                state.networks.insert(row.id, row);
                Ok(())
            })
            .await?;
        info!("created network {} for tenant {}", network.id, ctx.tenant_id);
        Ok(network)
    }

    pub async fn network(&self, id: NetworkId) -> IpamResult<Network> {
        self.store.read(|state| state.network(id).cloned()).await
    }

    /// Grant `target_tenant` shared access to the network. Granting to the
    /// wildcard tenant marks the network shared. Re-granting is a no-op.
    pub async fn grant_network_access(
        &self,
        ctx: &TenantContext,
        network_id: NetworkId,
        target_tenant: &str,
    ) -> IpamResult<()> {
        let target = target_tenant.to_string();
        let ctx = ctx.clone();
        self.retrying(|| {
            let target = target.clone();
            let ctx = ctx.clone();
            async move {
                self.store
                    .in_transaction(move |state| {
                        let network = state.network(network_id)?.clone();
                        check_network_admin(&ctx, &network)?;
                        if state
                            .grants_on_network(network_id)
                            .iter()
                            .any(|g| g.target_tenant == target)
                        {
                            return Ok(());
                        }
                        state.access_grants.push(AccessGrant {
                            network_id,
                            target_tenant: target.clone(),
                        });
                        if target == WILDCARD_TENANT {
                            if let Some(net) = state.networks.get_mut(&network_id) {
                                net.shared = true;
                            }
                        }
                        Ok(())
                    })
                    .await
            }
        })
        .await
    }

    /// Revoke a shared-access grant. The revocation is announced first and
    /// any listener may veto it while foreign tenants still depend on the
    /// network.
    pub async fn revoke_network_access(
        &self,
        ctx: &TenantContext,
        network_id: NetworkId,
        target_tenant: &str,
    ) -> IpamResult<()> {
        let (network, exists) = self
            .store
            .read(|state| {
                let network = state.network(network_id).cloned();
                let exists = state
                    .grants_on_network(network_id)
                    .iter()
                    .any(|g| g.target_tenant == target_tenant);
                (network, exists)
            })
            .await;
        let network = network?;
        check_network_admin(ctx, &network)?;
        if !exists {
            return Err(IpamError::not_found("access grant", target_tenant));
        }

        self.events
            .publish_guarded(IpamEvent::NetworkAccessBeforeRevoke {
                network_id,
                target_tenant: target_tenant.to_string(),
            })
            .await
            .map_err(guard_failure)?;

        let target = target_tenant.to_string();
        self.retrying(|| {
            let target = target.clone();
            async move {
                self.store
                    .in_transaction(move |state| {
                        state
                            .access_grants
                            .retain(|g| !(g.network_id == network_id && g.target_tenant == target));
                        let still_shared = state
                            .grants_on_network(network_id)
                            .iter()
                            .any(|g| g.target_tenant == WILDCARD_TENANT);
                        if let Some(net) = state.networks.get_mut(&network_id) {
                            net.shared = still_shared;
                        }
                        Ok(())
                    })
                    .await
            }
        })
        .await?;
        info!(
            "revoked access to network {} for tenant {}",
            network_id, target_tenant
        );
        Ok(())
    }

    // ---- address scopes ----

    pub async fn create_address_scope(
        &self,
        ctx: &TenantContext,
        name: &str,
        ip_version: IpVersion,
        shared: bool,
    ) -> IpamResult<AddressScope> {
        let scope = AddressScope {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id.clone(),
            name: name.to_string(),
            ip_version,
            shared,
        };
        let row = scope.clone();
        self.store
            .in_transaction(move |state| {
                state.address_scopes.insert(row.id, row);
                Ok(())
            })
            .await?;
        Ok(scope)
    }

    pub async fn address_scope(&self, id: AddressScopeId) -> IpamResult<AddressScope> {
        self.store
            .read(|state| state.address_scope(id).cloned())
            .await
    }

    // ---- subnet pools ----

    pub async fn create_subnetpool(
        &self,
        ctx: &TenantContext,
        spec: &SubnetPoolSpec,
    ) -> IpamResult<SubnetPool> {
        let pool = self
            .retrying(|| {
                let pool = pool_rules::build_pool(Uuid::new_v4(), spec);
                let ctx = ctx.clone();
                async move {
                    let pool = pool?;
                    let row = pool.clone();
                    self.store
                        .in_transaction(move |state| {
                            if row.is_default {
                                if let Some(existing) = state.default_pool(row.ip_version) {
                                    return Err(IpamError::conflict(format!(
                                        "subnet pool {} is already the default for ip_version '{}'",
                                        existing.id, row.ip_version
                                    )));
                                }
                            }
                            if let Some(scope_id) = row.address_scope_id {
                                let scope = state.address_scope(scope_id)?;
                                pool_rules::validate_scope_association(
                                    &ctx,
                                    row.id,
                                    &row.prefixes,
                                    row.ip_version,
                                    scope,
                                    &state.pools_in_scope(scope_id),
                                )?;
                            }
                            state.subnetpools.insert(row.id, row.clone());
                            Ok(row)
                        })
                        .await
                }
            })
            .await?;
        info!(
            "created subnet pool {} with prefixes {:?}",
            pool.id, pool.prefixes
        );
        Ok(pool)
    }

    pub async fn update_subnetpool(
        &self,
        ctx: &TenantContext,
        pool_id: SubnetPoolId,
        update: &SubnetPoolUpdate,
    ) -> IpamResult<SubnetPool> {
        let (pool, scope_changed) = self
            .retrying(|| {
                let ctx = ctx.clone();
                let update = update.clone();
                async move {
                    self.store
                        .in_transaction(move |state| {
                            let current = state.subnetpool(pool_id)?.clone();
                            if let Some(scope_id) = current.address_scope_id {
                                let scope = state.address_scope(scope_id)?;
                                pool_rules::check_pool_update_allowed(&ctx, &current, scope)?;
                            }
                            let updated = pool_rules::apply_pool_update(&current, &update)?;
                            if updated.is_default {
                                if let Some(existing) = state.default_pool(updated.ip_version) {
                                    if existing.id != updated.id {
                                        return Err(IpamError::conflict(format!(
                                            "subnet pool {} is already the default for \
                                             ip_version '{}'",
                                            existing.id, updated.ip_version
                                        )));
                                    }
                                }
                            }
                            if let Some(scope_id) = updated.address_scope_id {
                                let scope = state.address_scope(scope_id)?;
                                pool_rules::validate_scope_association(
                                    &ctx,
                                    updated.id,
                                    &updated.prefixes,
                                    updated.ip_version,
                                    scope,
                                    &state.pools_in_scope(scope_id),
                                )?;
                            }
                            let scope_changed = update.address_scope_id.is_some()
                                && updated.address_scope_id != current.address_scope_id;
                            state.subnetpools.insert(updated.id, updated.clone());
                            Ok((updated, scope_changed))
                        })
                        .await
                }
            })
            .await?;
        if scope_changed {
            self.events
                .publish(IpamEvent::SubnetPoolScopeAfterUpdate {
                    subnetpool_id: pool.id,
                })
                .await;
        }
        Ok(pool)
    }

    /// Delete a pool. Subnets carved from the pool keep it alive.
    pub async fn delete_subnetpool(
        &self,
        ctx: &TenantContext,
        pool_id: SubnetPoolId,
    ) -> IpamResult<()> {
        let ctx = ctx.clone();
        self.retrying(|| {
            let ctx = ctx.clone();
            async move {
                self.store
                    .in_transaction(move |state| {
                        let pool = state.subnetpool(pool_id)?;
                        if !ctx.owns(&pool.tenant_id) && !ctx.is_admin {
                            return Err(IpamError::invalid_input(format!(
                                "subnet pool {} belongs to another tenant",
                                pool_id
                            )));
                        }
                        if !state.subnets_from_pool(pool_id).is_empty() {
                            return Err(IpamError::in_use(format!(
                                "subnet pool {} has existing subnet allocations",
                                pool_id
                            )));
                        }
                        state.subnetpools.remove(&pool_id);
                        Ok(())
                    })
                    .await
            }
        })
        .await
    }

    pub async fn subnetpool(&self, id: SubnetPoolId) -> IpamResult<SubnetPool> {
        self.store.read(|state| state.subnetpool(id).cloned()).await
    }

    /// The default pool of the given address family, if one is configured.
    pub async fn get_default_subnetpool(&self, ip_version: IpVersion) -> IpamResult<SubnetPool> {
        self.store
            .read(move |state| {
                state
                    .default_pool(ip_version)
                    .cloned()
                    .ok_or_else(|| IpamError::not_found("default subnet pool", ip_version))
            })
            .await
    }

    // ---- subnets ----

    pub async fn create_subnet(
        &self,
        ctx: &TenantContext,
        spec: &SubnetSpec,
    ) -> IpamResult<Subnet> {
        // Surface the cidr/prefixlen exclusivity error before anything else.
        spec.requested_prefixlen()?;
        if spec.subnetpool.is_some() && spec.use_default_subnetpool {
            return Err(IpamError::invalid_input(
                "subnetpool and use_default_subnetpool cannot both be specified",
            ));
        }
        if spec.is_prefix_delegation() && !self.limits.ipv6_pd_enabled {
            return Err(IpamError::invalid_input(
                "prefix delegation is not enabled on this deployment",
            ));
        }
        if self.prefix_delegated(spec) {
            self.validator.validate_for_prefix_delegation(spec)?;
        }
        self.validator.validate(spec, None)?;

        let (subnet, external) = self
            .retrying(|| self.create_subnet_once(ctx, spec))
            .await?;
        info!(
            "created subnet {} ({}) on network {}",
            subnet.id, subnet.cidr, subnet.network_id
        );

        // A new subnet on an external network becomes a gateway candidate
        // for the routers already attached to it. A router whose gateway
        // port already holds a stateful address of this family keeps it.
        if external && !subnet.is_prefix_delegation() {
            if let Some(routers) = &self.routers {
                match routers
                    .routers_with_gateway_on_network(subnet.network_id)
                    .await
                {
                    Ok(list) => {
                        let network_id = subnet.network_id;
                        let auto_subnets: HashSet<SubnetId> = self
                            .store
                            .read(move |state| {
                                state
                                    .subnets_on_network(network_id)
                                    .iter()
                                    .filter(|s| s.is_auto_address())
                                    .map(|s| s.id)
                                    .collect()
                            })
                            .await;
                        for router in list {
                            if router_keeps_gateway(&router, &auto_subnets, subnet.ip_version) {
                                debug!(
                                    "router {} already holds a stateful gateway address",
                                    router.id
                                );
                                continue;
                            }
                            if let Err(err) =
                                routers.update_router_gateway(router.id, subnet.id).await
                            {
                                warn!(
                                    "gateway update for router {} on subnet {} failed: {}",
                                    router.id, subnet.id, err
                                );
                            }
                        }
                    }
                    Err(err) => warn!(
                        "router lookup for network {} failed: {}",
                        subnet.network_id, err
                    ),
                }
            }
        }
        Ok(subnet)
    }

    async fn create_subnet_once(
        &self,
        ctx: &TenantContext,
        spec: &SubnetSpec,
    ) -> IpamResult<(Subnet, bool)> {
        let id = Uuid::new_v4();
        let ctx = ctx.clone();
        let delegated = self.prefix_delegated(spec);
        let spec = spec.clone();
        let validator = self.validator.clone();
        self.store
            .in_transaction(move |state| {
                let network = state.network(spec.network_id)?.clone();
                check_network_usable(&ctx, &network, state.grants_on_network(network.id))?;

                let source = if delegated {
                    PrefixSource::Delegated
                } else if let Some(SubnetPoolRef::Pool(pool_id)) = spec.subnetpool {
                    PrefixSource::FromPool(pool_id)
                } else if spec.use_default_subnetpool {
                    let pool = state.default_pool(spec.ip_version).ok_or_else(|| {
                        IpamError::not_found("default subnet pool", spec.ip_version)
                    })?;
                    PrefixSource::FromPool(pool.id)
                } else {
                    let cidr = spec.cidr.ok_or_else(|| {
                        IpamError::invalid_input(
                            "a cidr or a subnet pool reference is required",
                        )
                    })?;
                    if spec.prefixlen.is_some() {
                        return Err(IpamError::invalid_input(
                            "prefixlen can only be used together with a subnet pool",
                        ));
                    }
                    PrefixSource::Explicit(cidr)
                };

                let (cidr, pool_ref) = match source {
                    PrefixSource::Explicit(cidr) => (cidr, None),
                    PrefixSource::Delegated => {
                        (provisional_pd_cidr()?, Some(SubnetPoolRef::PrefixDelegation))
                    }
                    PrefixSource::FromPool(pool_id) => {
                        let pool = state.subnetpool(pool_id)?;
                        if pool.ip_version != spec.ip_version {
                            return Err(IpamError::invalid_input(format!(
                                "subnet pool {} holds ip_version '{}' prefixes",
                                pool.id, pool.ip_version
                            )));
                        }
                        // Sibling allocations read in the same transaction
                        // that persists ours.
                        let siblings: Vec<IpNet> = state
                            .subnets_from_pool(pool_id)
                            .iter()
                            .map(|s| s.cidr)
                            .collect();
                        let request = SubnetRequest {
                            cidr: spec.cidr,
                            prefixlen: spec.prefixlen,
                        };
                        let cidr = SubnetAllocator::new(pool).allocate(&request, &siblings)?;
                        (cidr, Some(SubnetPoolRef::Pool(pool_id)))
                    }
                };

                // A delegated subnet carries the provisional prefix shared by
                // every pending delegation, so it is exempt from the overlap
                // rule until renumbered.
                if pool_ref != Some(SubnetPoolRef::PrefixDelegation) {
                    for sibling in state.subnets_on_network(spec.network_id) {
                        if addr_math::overlap(&sibling.cidr, &cidr) {
                            return Err(IpamError::conflict(format!(
                                "requested subnet {} overlaps subnet {} on network {}",
                                cidr, sibling.id, spec.network_id
                            )));
                        }
                    }
                }

                // Rules that needed the cidr run again now that it is known.
                let mut effective = spec.clone();
                effective.cidr = Some(cidr);
                effective.prefixlen = None;
                validator.validate(&effective, None)?;

                let allocation_pools = match &spec.allocation_pools {
                    Some(pools) => {
                        let sorted = validate_allocation_pools(pools, &cidr)?;
                        if let Some(gateway) = &spec.gateway_ip {
                            validate_gateway_out_of_pools(gateway, &sorted)?;
                        }
                        sorted
                    }
                    None => addr_math::range_from_cidr_excluding(&cidr, spec.gateway_ip),
                };

                let subnet = Subnet {
                    id,
                    network_id: spec.network_id,
                    tenant_id: spec.tenant_id.clone(),
                    name: spec.name.clone(),
                    ip_version: spec.ip_version,
                    cidr,
                    gateway_ip: spec.gateway_ip,
                    enable_dhcp: spec.enable_dhcp,
                    allocation_pools,
                    host_routes: spec.host_routes.clone(),
                    dns_nameservers: spec.dns_nameservers.clone(),
                    ipv6_ra_mode: spec.ipv6_ra_mode,
                    ipv6_address_mode: spec.ipv6_address_mode,
                    subnetpool: pool_ref,
                };
                state.subnets.insert(subnet.id, subnet.clone());
                Ok((subnet, network.external))
            })
            .await
    }

    pub async fn subnet(&self, id: SubnetId) -> IpamResult<Subnet> {
        self.store.read(|state| state.subnet(id).cloned()).await
    }

    pub async fn update_subnet(
        &self,
        ctx: &TenantContext,
        subnet_id: SubnetId,
        update: &SubnetUpdate,
    ) -> IpamResult<Subnet> {
        let (subnet, effects) = self
            .retrying(|| self.update_subnet_once(ctx, subnet_id, update))
            .await?;

        if effects.renumbered {
            self.reassign_port_addresses(&subnet).await;
        }
        if effects.gateway_changed {
            self.events
                .publish(IpamEvent::SubnetGatewayAfterUpdate {
                    subnet_id: subnet.id,
                    network_id: subnet.network_id,
                })
                .await;
        }
        Ok(subnet)
    }

    async fn update_subnet_once(
        &self,
        ctx: &TenantContext,
        subnet_id: SubnetId,
        update: &SubnetUpdate,
    ) -> IpamResult<(Subnet, SubnetUpdateEffects)> {
        let current = self.subnet(subnet_id).await?;
        if !ctx.owns(&current.tenant_id) && !ctx.is_admin {
            return Err(IpamError::invalid_input(format!(
                "subnet {} belongs to another tenant",
                subnet_id
            )));
        }

        let renumbered = match update.cidr {
            None => false,
            Some(new_cidr) => {
                if !current.is_prefix_delegation() {
                    return Err(IpamError::invalid_input(
                        "cidr of an existing subnet cannot be changed",
                    ));
                }
                if IpVersion::of_net(&new_cidr) != IpVersion::V6 {
                    return Err(IpamError::invalid_input(
                        "a delegated prefix must be IPv6",
                    ));
                }
                new_cidr != current.cidr
            }
        };

        let mut target = update.apply_to(&current);
        if renumbered {
            // The delegated prefix arrived: assign the first host as gateway
            // and rebuild the allocation pools around it.
            let gateway = addr_math::first_host(&target.cidr);
            target.gateway_ip = Some(gateway);
            if update.allocation_pools.is_none() {
                target.allocation_pools =
                    addr_math::range_from_cidr_excluding(&target.cidr, Some(gateway));
            }
        }
        let gateway_changed = target.gateway_ip != current.gateway_ip;

        // Only a gateway change needs the router-port lookup; an unchanged
        // gateway is never "in use" by its own port.
        let gateway_port = if gateway_changed && !renumbered {
            self.router_port_on_gateway(&current).await?
        } else {
            None
        };

        let spec = spec_for_validation(&target);
        self.validator.validate(
            &spec,
            Some(&CurrentSubnet {
                subnet: &current,
                gateway_port,
            }),
        )?;

        if let Some(pools) = &update.allocation_pools {
            target.allocation_pools = validate_allocation_pools(pools, &target.cidr)?;
        }
        if update.allocation_pools.is_some() || gateway_changed {
            if let Some(gateway) = &target.gateway_ip {
                validate_gateway_out_of_pools(gateway, &target.allocation_pools)?;
            }
        }

        if gateway_changed {
            self.events
                .publish_guarded(IpamEvent::SubnetGatewayBeforeUpdate {
                    subnet_id,
                    network_id: current.network_id,
                })
                .await
                .map_err(guard_failure)?;
        }

        let row = target.clone();
        let snapshot = current;
        self.store
            .in_transaction(move |state| {
                // The row must still match the read this update was derived
                // from; a concurrent commit re-runs the whole derivation
                // against fresh state instead of clobbering it.
                if *state.subnet(subnet_id)? != snapshot {
                    return Err(IpamError::TransientStoreConflict);
                }
                state.subnets.insert(row.id, row);
                Ok(())
            })
            .await?;
        Ok((
            target,
            SubnetUpdateEffects {
                gateway_changed,
                renumbered,
            },
        ))
    }

    /// Delete a subnet. Listeners may veto; ports with manually assigned
    /// addresses block the deletion, infrastructure allocations are released
    /// automatically.
    pub async fn delete_subnet(&self, ctx: &TenantContext, subnet_id: SubnetId) -> IpamResult<()> {
        let current = self.subnet(subnet_id).await?;
        if !ctx.owns(&current.tenant_id) && !ctx.is_admin {
            return Err(IpamError::invalid_input(format!(
                "subnet {} belongs to another tenant",
                subnet_id
            )));
        }

        self.events
            .publish_guarded(IpamEvent::SubnetBeforeDelete { subnet_id })
            .await
            .map_err(guard_failure)?;

        let ports = self
            .ports
            .ports_with_fixed_ip_on_subnet(subnet_id)
            .await
            .map_err(collaborator_error)?;
        // Auto-addressed subnets re-derive every address, only router
        // interfaces pin them down. Everywhere else any port outside the
        // auto-delete owners blocks the deletion.
        let blocking: Option<&Port> = if current.is_auto_address() {
            ports
                .iter()
                .find(|p| device_owner::is_router_interface(&p.device_owner))
        } else {
            ports
                .iter()
                .find(|p| !device_owner::is_auto_delete(&p.device_owner))
        };
        if let Some(port) = blocking {
            return Err(IpamError::in_use(format!(
                "subnet {} still has an allocation on port {} ({})",
                subnet_id, port.id, port.device_owner
            )));
        }
        self.retrying(|| async {
            self.store
                .in_transaction(move |state| {
                    state.subnet(subnet_id)?;
                    state.subnets.remove(&subnet_id);
                    Ok(())
                })
                .await
        })
        .await?;
        info!("deleted subnet {} ({})", subnet_id, current.cidr);

        // Infrastructure allocations are released only once the row is gone;
        // a failed patch is logged, the deletion itself already happened.
        for port in &ports {
            let fixed_ips: Vec<FixedIp> = port
                .fixed_ips
                .iter()
                .filter(|f| f.subnet_id != subnet_id)
                .cloned()
                .collect();
            if let Err(err) = self
                .ports
                .update_port(
                    port.id,
                    PortPatch {
                        fixed_ips: Some(fixed_ips),
                    },
                )
                .await
            {
                warn!("fixed ip release on port {} failed: {}", port.id, err);
            }
        }
        Ok(())
    }

    // ---- internals ----

    /// Whether the request resolves to the prefix-delegation source, either
    /// through the reserved pool reference or through a v6 default-pool
    /// request on a deployment with delegation enabled.
    fn prefix_delegated(&self, spec: &SubnetSpec) -> bool {
        spec.is_prefix_delegation()
            || (spec.use_default_subnetpool
                && spec.ip_version == IpVersion::V6
                && self.limits.ipv6_pd_enabled)
    }

    /// Router-interface port currently bound to the subnet's gateway, if any.
    async fn router_port_on_gateway(&self, subnet: &Subnet) -> IpamResult<Option<PortId>> {
        let gateway = match subnet.gateway_ip {
            Some(gateway) => gateway,
            None => return Ok(None),
        };
        let ports = self
            .ports
            .ports_with_fixed_ip_on_subnet(subnet.id)
            .await
            .map_err(collaborator_error)?;
        Ok(ports
            .iter()
            .find(|p| {
                device_owner::is_router_interface(&p.device_owner)
                    && p.fixed_ips
                        .iter()
                        .any(|f| f.subnet_id == subnet.id && f.ip_address == Some(gateway))
            })
            .map(|p| p.id))
    }

    /// After a renumbering commit, router interfaces move to the new gateway
    /// and every other port loses its stale address until re-allocation.
    async fn reassign_port_addresses(&self, subnet: &Subnet) {
        let ports = match self.ports.ports_with_fixed_ip_on_subnet(subnet.id).await {
            Ok(ports) => ports,
            Err(err) => {
                warn!("port lookup for subnet {} failed: {}", subnet.id, err);
                return;
            }
        };
        let mut router_ids: Vec<RouterId> = Vec::new();
        for port in ports {
            let is_router = device_owner::is_router_interface(&port.device_owner);
            let fixed_ips: Vec<FixedIp> = port
                .fixed_ips
                .iter()
                .map(|f| {
                    if f.subnet_id != subnet.id {
                        f.clone()
                    } else if is_router {
                        FixedIp {
                            subnet_id: subnet.id,
                            ip_address: subnet.gateway_ip,
                        }
                    } else {
                        FixedIp {
                            subnet_id: subnet.id,
                            ip_address: None,
                        }
                    }
                })
                .collect();
            if let Err(err) = self
                .ports
                .update_port(
                    port.id,
                    PortPatch {
                        fixed_ips: Some(fixed_ips),
                    },
                )
                .await
            {
                warn!("address reassignment on port {} failed: {}", port.id, err);
            }
            if is_router {
                if let Ok(router_id) = port.device_id.parse::<RouterId>() {
                    router_ids.push(router_id);
                }
            }
        }
        if let Some(routers) = &self.routers {
            if !router_ids.is_empty() {
                if let Err(err) = routers.notify_routers_updated(router_ids).await {
                    warn!("router notification for subnet {} failed: {}", subnet.id, err);
                }
            }
        }
    }

    /// Re-run an operation while it fails with a transient store conflict.
    async fn retrying<T, F, Fut>(&self, mut attempt: F) -> IpamResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = IpamResult<T>>,
    {
        let mut tries = 0u32;
        loop {
            match attempt().await {
                Err(err) if err.is_retriable() && tries + 1 < self.limits.store_retry_limit => {
                    tries += 1;
                    debug!("store conflict, retrying (attempt {})", tries + 1);
                }
                other => return other,
            }
        }
    }
}

fn provisional_pd_cidr() -> IpamResult<IpNet> {
    PROVISIONAL_V6_PD_CIDR
        .parse()
        .map_err(|_| IpamError::invalid_input("malformed provisional delegation prefix"))
}

/// A router gateway port holds at most one stateful fixed ip per address
/// family; auto-addressed (SLAAC/stateless) allocations never pin it down.
fn router_keeps_gateway(
    router: &RouterRef,
    auto_subnets: &HashSet<SubnetId>,
    family: IpVersion,
) -> bool {
    let stateful: Vec<&FixedIp> = router
        .external_fixed_ips
        .iter()
        .filter(|f| !auto_subnets.contains(&f.subnet_id))
        .collect();
    if stateful.len() > 1 {
        return true;
    }
    stateful.len() == 1
        && stateful[0]
            .ip_address
            .map_or(false, |ip| IpVersion::of_addr(&ip) == family)
}

fn guard_failure(err: EventBusError) -> IpamError {
    IpamError::in_use(err.to_string())
}

fn collaborator_error(err: anyhow::Error) -> IpamError {
    IpamError::conflict(err.to_string())
}

/// The caller must own the network or be an admin.
fn check_network_admin(ctx: &TenantContext, network: &Network) -> IpamResult<()> {
    if !ctx.owns(&network.tenant_id) && !ctx.is_admin {
        return Err(IpamError::invalid_input(format!(
            "network {} belongs to another tenant",
            network.id
        )));
    }
    Ok(())
}

/// The caller must own the network, be an admin, or hold an access grant.
fn check_network_usable(
    ctx: &TenantContext,
    network: &Network,
    grants: Vec<&AccessGrant>,
) -> IpamResult<()> {
    if ctx.owns(&network.tenant_id) || ctx.is_admin {
        return Ok(());
    }
    let granted = grants
        .iter()
        .any(|g| g.target_tenant == WILDCARD_TENANT || g.target_tenant == ctx.tenant_id);
    if !granted {
        return Err(IpamError::invalid_input(format!(
            "network {} is not shared with tenant {}",
            network.id, ctx.tenant_id
        )));
    }
    Ok(())
}

/// Project a subnet row back into the spec form the validator understands.
fn spec_for_validation(subnet: &Subnet) -> SubnetSpec {
    SubnetSpec {
        network_id: subnet.network_id,
        tenant_id: subnet.tenant_id.clone(),
        name: subnet.name.clone(),
        ip_version: subnet.ip_version,
        cidr: Some(subnet.cidr),
        prefixlen: None,
        gateway_ip: subnet.gateway_ip,
        enable_dhcp: subnet.enable_dhcp,
        allocation_pools: None,
        host_routes: subnet.host_routes.clone(),
        dns_nameservers: subnet.dns_nameservers.clone(),
        ipv6_ra_mode: subnet.ipv6_ra_mode,
        ipv6_address_mode: subnet.ipv6_address_mode,
        subnetpool: subnet.subnetpool,
        use_default_subnetpool: false,
    }
}

//! Collaborator interfaces for ports and routers.
//!
//! Ports and routers are owned by other services; the core only reads them
//! and patches addresses through these traits. The L3 router service is
//! optional: deployments without it inject `None` and callers branch on
//! presence.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use vnet_shared_types::{NetworkId, Port, PortId, PortPatch, RouterId, RouterRef, SubnetId};

/// Directory of ports attached to networks managed by this control plane.
#[async_trait]
pub trait PortDirectory: Send + Sync {
    async fn ports_on_network(&self, network_id: NetworkId) -> Result<Vec<Port>>;
    async fn ports_with_fixed_ip_on_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Port>>;
    async fn update_port(&self, id: PortId, patch: PortPatch) -> Result<()>;
}

/// Optional L3 service interface.
#[async_trait]
pub trait RouterService: Send + Sync {
    async fn routers_with_gateway_on_network(&self, network_id: NetworkId)
        -> Result<Vec<RouterRef>>;
    /// Attach a gateway fixed ip on the given subnet to the router.
    async fn update_router_gateway(&self, router_id: RouterId, subnet_id: SubnetId) -> Result<()>;
    async fn notify_routers_updated(&self, router_ids: Vec<RouterId>) -> Result<()>;
}

/// In-memory port directory for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryPortDirectory {
    ports: Arc<RwLock<HashMap<PortId, Port>>>,
}

impl MemoryPortDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_port(&self, port: Port) {
        self.ports.write().await.insert(port.id, port);
    }

    pub async fn remove_port(&self, id: PortId) {
        self.ports.write().await.remove(&id);
    }

    pub async fn get_port(&self, id: PortId) -> Option<Port> {
        self.ports.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl PortDirectory for MemoryPortDirectory {
    async fn ports_on_network(&self, network_id: NetworkId) -> Result<Vec<Port>> {
        let ports = self.ports.read().await;
        Ok(ports
            .values()
            .filter(|p| p.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn ports_with_fixed_ip_on_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Port>> {
        let ports = self.ports.read().await;
        Ok(ports
            .values()
            .filter(|p| p.fixed_ips.iter().any(|ip| ip.subnet_id == subnet_id))
            .cloned()
            .collect())
    }

    async fn update_port(&self, id: PortId, patch: PortPatch) -> Result<()> {
        let mut ports = self.ports.write().await;
        let port = ports
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("port {} not found", id))?;
        if let Some(fixed_ips) = patch.fixed_ips {
            port.fixed_ips = fixed_ips;
        }
        Ok(())
    }
}

/// In-memory router service for tests. Records the gateway updates and
/// notifications it receives.
#[derive(Clone, Default)]
pub struct MemoryRouterService {
    routers: Arc<RwLock<HashMap<RouterId, (NetworkId, RouterRef)>>>,
    gateway_updates: Arc<RwLock<Vec<(RouterId, SubnetId)>>>,
    notified: Arc<RwLock<Vec<RouterId>>>,
}

impl MemoryRouterService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_router(&self, network_id: NetworkId, router: RouterRef) {
        self.routers
            .write()
            .await
            .insert(router.id, (network_id, router));
    }

    pub async fn gateway_updates(&self) -> Vec<(RouterId, SubnetId)> {
        self.gateway_updates.read().await.clone()
    }

    pub async fn notified_routers(&self) -> Vec<RouterId> {
        self.notified.read().await.clone()
    }
}

#[async_trait]
impl RouterService for MemoryRouterService {
    async fn routers_with_gateway_on_network(
        &self,
        network_id: NetworkId,
    ) -> Result<Vec<RouterRef>> {
        let routers = self.routers.read().await;
        Ok(routers
            .values()
            .filter(|(net, _)| *net == network_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn update_router_gateway(&self, router_id: RouterId, subnet_id: SubnetId) -> Result<()> {
        self.gateway_updates
            .write()
            .await
            .push((router_id, subnet_id));
        Ok(())
    }

    async fn notify_routers_updated(&self, router_ids: Vec<RouterId>) -> Result<()> {
        self.notified.write().await.extend(router_ids);
        Ok(())
    }
}

//! In-memory transactional store.
//!
//! Mutations run against a snapshot of the current state and commit with an
//! optimistic version check: if another writer committed in between, the
//! transaction fails with [`IpamError::TransientStoreConflict`] and the
//! caller re-runs the whole operation from validation onward. This mirrors
//! the conflict-detection contract of a read-committed SQL store without
//! pulling in an engine.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use vnet_shared_types::{
    AccessGrant, AddressScope, AddressScopeId, IpamError, IpamResult, Network, NetworkId, Subnet,
    SubnetId, SubnetPool, SubnetPoolId, SubnetPoolRef,
};

/// All entities owned by the core, keyed by id. Cross-entity references are
/// by id only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub networks: HashMap<NetworkId, Network>,
    pub subnets: HashMap<SubnetId, Subnet>,
    pub subnetpools: HashMap<SubnetPoolId, SubnetPool>,
    pub address_scopes: HashMap<AddressScopeId, AddressScope>,
    pub access_grants: Vec<AccessGrant>,
}

impl StoreState {
    pub fn network(&self, id: NetworkId) -> IpamResult<&Network> {
        self.networks
            .get(&id)
            .ok_or_else(|| IpamError::not_found("network", id))
    }

    pub fn subnet(&self, id: SubnetId) -> IpamResult<&Subnet> {
        self.subnets
            .get(&id)
            .ok_or_else(|| IpamError::not_found("subnet", id))
    }

    pub fn subnetpool(&self, id: SubnetPoolId) -> IpamResult<&SubnetPool> {
        self.subnetpools
            .get(&id)
            .ok_or_else(|| IpamError::not_found("subnetpool", id))
    }

    pub fn address_scope(&self, id: AddressScopeId) -> IpamResult<&AddressScope> {
        self.address_scopes
            .get(&id)
            .ok_or_else(|| IpamError::not_found("address scope", id))
    }

    /// Subnets carved from the given pool, the sibling set the allocator
    /// re-validates against before reserving.
    pub fn subnets_from_pool(&self, pool_id: SubnetPoolId) -> Vec<&Subnet> {
        self.subnets
            .values()
            .filter(|s| s.subnetpool == Some(SubnetPoolRef::Pool(pool_id)))
            .collect()
    }

    pub fn subnets_on_network(&self, network_id: NetworkId) -> Vec<&Subnet> {
        self.subnets
            .values()
            .filter(|s| s.network_id == network_id)
            .collect()
    }

    /// Pools bound to the given address scope.
    pub fn pools_in_scope(&self, scope_id: AddressScopeId) -> Vec<&SubnetPool> {
        self.subnetpools
            .values()
            .filter(|p| p.address_scope_id == Some(scope_id))
            .collect()
    }

    pub fn default_pool(&self, ip_version: vnet_shared_types::IpVersion) -> Option<&SubnetPool> {
        self.subnetpools
            .values()
            .find(|p| p.is_default && p.ip_version == ip_version)
    }

    pub fn grants_on_network(&self, network_id: NetworkId) -> Vec<&AccessGrant> {
        self.access_grants
            .iter()
            .filter(|g| g.network_id == network_id)
            .collect()
    }
}

struct Versioned {
    version: u64,
    state: StoreState,
}

/// Shared in-memory store with optimistic transaction semantics.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                state: StoreState::default(),
            })),
        }
    }

    /// Run a read-only closure against the current state.
    pub async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.inner.read().await;
        f(&guard.state)
    }

    /// Run a mutation inside a transaction.
    ///
    /// The closure sees a private copy of the state taken at transaction
    /// begin; reads through it are therefore fresh with respect to the
    /// reserving write. The copy replaces the shared state only if no other
    /// transaction committed in the meantime, otherwise the whole attempt
    /// fails with `TransientStoreConflict` and nothing is persisted.
    pub async fn in_transaction<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> IpamResult<T>,
    ) -> IpamResult<T> {
        let (base_version, mut working) = {
            let guard = self.inner.read().await;
            (guard.version, guard.state.clone())
        };

        let out = f(&mut working)?;

        let mut guard = self.inner.write().await;
        if guard.version != base_version {
            return Err(IpamError::TransientStoreConflict);
        }
        guard.version += 1;
        guard.state = working;
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn network(tenant: &str) -> Network {
        Network {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: "net".into(),
            shared: false,
            external: false,
        }
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let store = MemoryStore::new();
        let net = network("t1");
        let id = net.id;

        store
            .in_transaction(|state| {
                state.networks.insert(net.id, net.clone());
                Ok(())
            })
            .await
            .unwrap();

        let found = store.read(|state| state.networks.get(&id).cloned()).await;
        assert_eq!(found.unwrap().tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let net = network("t1");
        let id = net.id;

        let result: IpamResult<()> = store
            .in_transaction(|state| {
                state.networks.insert(net.id, net.clone());
                Err(IpamError::invalid_input("boom"))
            })
            .await;
        assert!(result.is_err());

        let found = store.read(|state| state.networks.contains_key(&id)).await;
        assert!(!found);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_commit_detected() {
        let store = MemoryStore::new();

        // Begin a transaction by taking the snapshot, then let a second
        // writer commit before the first one does.
        let first = network("t1");
        let second = network("t2");

        let store_b = store.clone();
        let second_clone = second.clone();

        // Interleave manually: the outer transaction's closure commits the
        // inner one through a second handle before returning.
        let result = store
            .in_transaction(|state| {
                state.networks.insert(first.id, first.clone());
                // A competing writer sneaks in while this txn is open.
                let handle = tokio::runtime::Handle::current();
                tokio::task::block_in_place(|| {
                    handle.block_on(store_b.in_transaction(|inner| {
                        inner.networks.insert(second_clone.id, second_clone.clone());
                        Ok(())
                    }))
                })?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(IpamError::TransientStoreConflict)));
        // Only the competing writer's network is visible.
        let count = store.read(|state| state.networks.len()).await;
        assert_eq!(count, 1);
    }
}

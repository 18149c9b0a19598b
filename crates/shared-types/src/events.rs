use serde::{Deserialize, Serialize};

use crate::network::NetworkId;
use crate::pool::SubnetPoolId;
use crate::subnet::SubnetId;

/// Lifecycle events published on the event bus.
///
/// `*Before*` events are guarded: a listener returning an error vetoes the
/// operation and the publisher surfaces the rejection as a guard failure.
/// `*After*` events are informational and listener failures are only logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IpamEvent {
    /// A subnet is about to be deleted; collaborators still depending on it
    /// veto the deletion.
    SubnetBeforeDelete { subnet_id: SubnetId },
    /// The subnet gateway is about to change.
    SubnetGatewayBeforeUpdate {
        subnet_id: SubnetId,
        network_id: NetworkId,
    },
    /// The subnet gateway changed; router agents refresh their routes.
    SubnetGatewayAfterUpdate {
        subnet_id: SubnetId,
        network_id: NetworkId,
    },
    /// A shared-access grant is about to be revoked from a network.
    NetworkAccessBeforeRevoke {
        network_id: NetworkId,
        target_tenant: String,
    },
    /// A pool moved to a different address scope.
    SubnetPoolScopeAfterUpdate { subnetpool_id: SubnetPoolId },
}

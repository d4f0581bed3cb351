//! Startup reconciliation of the persisted registry against host devices.
//!
//! Devices of running containers live inside the container's namespace, so
//! they cannot be deleted from here. A device we *can* delete, or an endpoint
//! that was never plugged, belongs to a container that is gone.

use log::{info, warn};

use super::network::Networks;
use crate::{host::LinkManager, store::Store};

/// Loads the last snapshot and prunes stale endpoints from it.
///
/// Returns `None` when there is nothing usable to restore.
pub(super) fn restore(store: &dyn Store, links: &dyn LinkManager) -> Option<Networks> {
    let blob = match store.load() {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            info!("No previous state to restore");
            return None;
        }
        Err(e) => {
            warn!("Failed to load previous state: {e:#}");
            return None;
        }
    };

    let mut networks = match Networks::from_blob(&blob) {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Ignoring unreadable previous state: {e:#}");
            return None;
        }
    };

    let pruned = prune_stale_endpoints(&mut networks, links);
    info!(
        "Restored {} networks, {} endpoints ({pruned} stale endpoints pruned)",
        networks.networks.len(),
        networks.endpoint_count()
    );

    Some(networks)
}

/// Drops every endpoint that is unplugged or whose device could be deleted.
pub(super) fn prune_stale_endpoints(networks: &mut Networks, links: &dyn LinkManager) -> usize {
    let mut pruned = 0;

    for (network_id, network) in networks.networks.iter_mut() {
        network.endpoints.retain(|endpoint_id, endpoint| {
            let stale =
                !endpoint.is_attached() || links.delete_device(&endpoint.device_name).is_ok();
            if stale {
                info!("Pruning endpoint {endpoint_id} of network {network_id}");
                pruned += 1;
            }
            !stale
        });
    }

    pruned
}

//! The network driver: registry of networks and endpoints behind one lock.
//!
//! Every mutation holds the write lock for its whole duration, host calls and
//! the trailing persist included. Persisting is best effort: a failed save is
//! logged and the in-memory state stays authoritative for this process.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::{debug, info, warn};

mod endpoint;
mod network;
mod recovery;

pub use endpoint::{device_name, random_mac, EndpointState};
pub use network::{NetworkState, Networks, IF_PREFIX_DEFAULT, IF_PREFIX_MAX_LEN};

use self::{endpoint::AttachError, network::strip_mask};
use crate::{
    api::*,
    error::{DriverError, DriverResult},
    host::{LinkManager, SwitchClient},
    store::Store,
};

pub struct Driver {
    networks: RwLock<Networks>,
    store: Arc<dyn Store>,
    links: Arc<dyn LinkManager>,
    switch: Arc<dyn SwitchClient>,
}

impl Driver {
    /// Builds the driver from persisted state.
    ///
    /// With `clean` the store is wiped and the driver starts empty; otherwise
    /// the last snapshot is restored, stale endpoints are pruned and the
    /// result is saved back.
    pub fn new(
        store: Arc<dyn Store>,
        links: Arc<dyn LinkManager>,
        switch: Arc<dyn SwitchClient>,
        clean: bool,
    ) -> Self {
        let driver = Driver {
            networks: RwLock::new(Networks::default()),
            store,
            links,
            switch,
        };

        if clean {
            info!("Cleaning the data store");
            if let Err(e) = driver.store.clear() {
                warn!("Failed to clean the data store: {e:#}");
            }
        } else if let Some(restored) = recovery::restore(&*driver.store, &*driver.links) {
            let mut networks = driver.write();
            *networks = restored;
            driver.persist(&networks);
        }

        driver
    }

    /// Copy of the current registry.
    pub fn snapshot(&self) -> Networks {
        self.read().clone()
    }

    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            scope: Scope::Local,
        }
    }

    pub fn create_network(&self, req: &CreateNetworkRequest) -> DriverResult<()> {
        debug!("CreateNetwork request: [ {req:?} ]");

        let network = NetworkState::from_request(req)?;

        let mut networks = self.write();
        if networks.networks.contains_key(&req.network_id) {
            warn!("Network {} already exists, replacing it", req.network_id);
        }
        networks.networks.insert(req.network_id.clone(), network);
        info!("Network {} created", req.network_id);

        self.persist(&networks);
        Ok(())
    }

    pub fn delete_network(&self, req: &DeleteNetworkRequest) -> DriverResult<()> {
        debug!("DeleteNetwork request: [ {req:?} ]");

        let mut networks = self.write();
        if !networks.get(&req.network_id)?.endpoints.is_empty() {
            return Err(DriverError::precondition_failed(
                "There are still active endpoints.",
            ));
        }
        networks.networks.remove(&req.network_id);
        info!("Network {} deleted", req.network_id);

        self.persist(&networks);
        Ok(())
    }

    pub fn allocate_network(
        &self,
        _req: &AllocateNetworkRequest,
    ) -> DriverResult<AllocateNetworkResponse> {
        Err(DriverError::not_implemented("AllocateNetwork"))
    }

    pub fn free_network(&self, _req: &FreeNetworkRequest) -> DriverResult<()> {
        Err(DriverError::not_implemented("FreeNetwork"))
    }

    pub fn create_endpoint(
        &self,
        req: &CreateEndpointRequest,
    ) -> DriverResult<CreateEndpointResponse> {
        debug!("CreateEndpoint request: [ {req:?} ]");

        let mut networks = self.write();
        let network = networks.get_mut(&req.network_id)?;
        if network.endpoints.contains_key(&req.endpoint_id) {
            return Err(DriverError::already_exists("EndpointID already exists."));
        }

        let endpoint = EndpointState::new(
            &req.endpoint_id,
            &network.if_prefix,
            req.interface.as_ref(),
        );

        // The runtime owns the interface identity; only hand back what we made up.
        let requested_mac = req
            .interface
            .as_ref()
            .is_some_and(|iface| !iface.mac_address.is_empty());
        let interface = EndpointInterface {
            mac_address: if requested_mac {
                String::new()
            } else {
                endpoint.mac_address.clone()
            },
            ..Default::default()
        };

        info!(
            "Endpoint {} created on network {} as {}",
            req.endpoint_id, req.network_id, endpoint.device_name
        );
        network.endpoints.insert(req.endpoint_id.clone(), endpoint);

        self.persist(&networks);
        Ok(CreateEndpointResponse {
            interface: Some(interface),
        })
    }

    pub fn delete_endpoint(&self, req: &DeleteEndpointRequest) -> DriverResult<()> {
        debug!("DeleteEndpoint request: [ {req:?} ]");

        let mut networks = self.write();
        let network = networks.get_mut(&req.network_id)?;
        let Some(endpoint) = network.endpoints.get(&req.endpoint_id) else {
            return Err(DriverError::not_found("Endpoint not found."));
        };

        // The switch attachment is not released here, only on Leave.
        if endpoint.is_attached() {
            warn!(
                "Endpoint {} deleted while still plugged as {}",
                req.endpoint_id, endpoint.attachment
            );
        }
        if let Err(e) = self.links.delete_device(&endpoint.device_name) {
            debug!("Device {} not removed: {e:#}", endpoint.device_name);
        }
        network.endpoints.remove(&req.endpoint_id);
        info!("Endpoint {} deleted", req.endpoint_id);

        self.persist(&networks);
        Ok(())
    }

    pub fn endpoint_info(&self, req: &InfoRequest) -> DriverResult<InfoResponse> {
        debug!("EndpointInfo request: [ {req:?} ]");

        let networks = self.read();
        let endpoint = networks.endpoint(&req.network_id, &req.endpoint_id)?;

        let value = HashMap::from([
            ("id".to_string(), req.endpoint_id.clone()),
            ("srcName".to_string(), endpoint.device_name.clone()),
        ]);

        Ok(InfoResponse { value })
    }

    pub fn join(&self, req: &JoinRequest) -> DriverResult<JoinResponse> {
        debug!("Join request: [ {req:?} ]");

        let mut networks = self.write();
        let network = networks.get_mut(&req.network_id)?;
        let Some(endpoint) = network.endpoints.get_mut(&req.endpoint_id) else {
            return Err(DriverError::not_found("Endpoint not found."));
        };

        match endpoint.attach(&network.switch_address, &*self.links, &*self.switch) {
            Ok(()) => {}
            Err(AttachError::Device(e)) => {
                warn!("Join of {} failed: {e:#}", req.endpoint_id);
                return Err(DriverError::retryable("Failed link create.", e));
            }
            Err(AttachError::Switch(e)) => {
                warn!("Join of {} failed: {e:#}", req.endpoint_id);
                return Err(DriverError::not_found_caused("Failed plug to interface.", e));
            }
        }
        endpoint.sandbox_key = req.sandbox_key.clone();

        let response = JoinResponse {
            interface_name: InterfaceName {
                src_name: endpoint.device_name.clone(),
                dst_prefix: network.if_prefix.clone(),
            },
            gateway: strip_mask(&network.ipv4_gateway),
            gateway_ipv6: strip_mask(&network.ipv6_gateway),
            disable_gateway_service: false,
        };
        info!(
            "Endpoint {} joined {} via {}",
            req.endpoint_id, network.switch_address, endpoint.device_name
        );

        self.persist(&networks);
        Ok(response)
    }

    pub fn leave(&self, req: &LeaveRequest) -> DriverResult<()> {
        debug!("Leave request: [ {req:?} ]");

        let mut networks = self.write();
        let network = networks.get_mut(&req.network_id)?;
        let Some(endpoint) = network.endpoints.get_mut(&req.endpoint_id) else {
            return Err(DriverError::not_found("Endpoint not found."));
        };

        endpoint.detach(&*self.links, &*self.switch);
        info!("Endpoint {} left network {}", req.endpoint_id, req.network_id);

        self.persist(&networks);
        Ok(())
    }

    pub fn discover_new(&self, _req: &DiscoveryNotification) -> DriverResult<()> {
        Ok(())
    }

    pub fn discover_delete(&self, _req: &DiscoveryNotification) -> DriverResult<()> {
        Ok(())
    }

    pub fn program_external_connectivity(
        &self,
        _req: &ProgramExternalConnectivityRequest,
    ) -> DriverResult<()> {
        Ok(())
    }

    pub fn revoke_external_connectivity(
        &self,
        _req: &RevokeExternalConnectivityRequest,
    ) -> DriverResult<()> {
        Ok(())
    }

    /// Saves `networks`; must be called with the write lock held.
    fn persist(&self, networks: &Networks) {
        let result = networks
            .to_blob()
            .and_then(|blob| self.store.save(&blob));

        if let Err(e) = result {
            warn!("Failed to persist driver state: {e:#}");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Networks> {
        self.networks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Networks> {
        self.networks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

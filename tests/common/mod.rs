//! In-memory stand-ins for the host, shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use serde_json::json;
use vdenet::{
    api::{CreateEndpointRequest, CreateNetworkRequest, EndpointInterface, JoinRequest},
    host::{AttachmentHandle, LinkManager, SwitchClient},
    store::Store,
    Driver,
};

pub const NETWORK_ID: &str = "net1";
pub const ENDPOINT_ID: &str = "0123456789abcdef0123";
pub const DEVICE_NAME: &str = "vde0123456789a";
pub const SWITCH: &str = "vxvde://239.1.2.3";

#[derive(Clone, Default)]
pub struct FakeStore {
    pub blob: Arc<Mutex<Option<Vec<u8>>>>,
    pub fail_save: Arc<AtomicBool>,
    pub saves: Arc<AtomicUsize>,
    pub clears: Arc<AtomicUsize>,
}

impl FakeStore {
    pub fn contents(&self) -> serde_json::Value {
        let blob = self.blob.lock().unwrap();
        match blob.as_deref() {
            Some(b) if !b.is_empty() => serde_json::from_slice(b).unwrap(),
            _ => serde_json::Value::Null,
        }
    }
}

impl Store for FakeStore {
    fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().unwrap().clone().filter(|b| !b.is_empty()))
    }

    fn save(&self, blob: &[u8]) -> anyhow::Result<()> {
        if self.fail_save.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.blob.lock().unwrap() = Some(blob.to_vec());
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        *self.blob.lock().unwrap() = Some(Vec::new());
        Ok(())
    }
}

/// Devices living in the driver's namespace, plus devices that exist but
/// cannot be deleted from here (moved into a container).
#[derive(Clone, Default)]
pub struct FakeLinks {
    pub devices: Arc<Mutex<HashMap<String, String>>>,
    pub addresses: Arc<Mutex<Vec<(String, String)>>>,
    pub busy: Arc<Mutex<HashSet<String>>>,
    pub fail_create: Arc<AtomicBool>,
}

impl FakeLinks {
    pub fn has_device(&self, name: &str) -> bool {
        self.devices.lock().unwrap().contains_key(name)
    }

    pub fn mac_of(&self, name: &str) -> Option<String> {
        self.devices.lock().unwrap().get(name).cloned()
    }
}

impl LinkManager for FakeLinks {
    fn create_device(&self, name: &str, mac: &str) -> anyhow::Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("Operation not permitted");
        }
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(name) {
            anyhow::bail!("Device {name} exists");
        }
        devices.insert(name.to_string(), mac.to_string());
        Ok(())
    }

    fn assign_address(&self, name: &str, cidr: &str) -> anyhow::Result<()> {
        if !self.has_device(name) {
            anyhow::bail!("Link {name} not found");
        }
        self.addresses
            .lock()
            .unwrap()
            .push((name.to_string(), cidr.to_string()));
        Ok(())
    }

    fn delete_device(&self, name: &str) -> anyhow::Result<()> {
        if self.busy.lock().unwrap().contains(name) {
            anyhow::bail!("Link {name} not found");
        }
        match self.devices.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => anyhow::bail!("Link {name} not found"),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeSwitch {
    pub next: Arc<AtomicUsize>,
    pub plugged: Arc<Mutex<HashMap<AttachmentHandle, (String, String)>>>,
    pub detached: Arc<Mutex<Vec<AttachmentHandle>>>,
    pub fail_attach: Arc<AtomicBool>,
}

impl FakeSwitch {
    pub fn plugged_count(&self) -> usize {
        self.plugged.lock().unwrap().len()
    }
}

impl SwitchClient for FakeSwitch {
    fn attach(&self, device: &str, switch_address: &str) -> anyhow::Result<AttachmentHandle> {
        if self.fail_attach.load(Ordering::SeqCst) {
            anyhow::bail!("vde_plug: {switch_address}: connection refused");
        }
        let handle = AttachmentHandle::new(self.next.fetch_add(1, Ordering::SeqCst) + 100);
        self.plugged
            .lock()
            .unwrap()
            .insert(handle, (device.to_string(), switch_address.to_string()));
        Ok(handle)
    }

    fn detach(&self, handle: AttachmentHandle) {
        self.plugged.lock().unwrap().remove(&handle);
        self.detached.lock().unwrap().push(handle);
    }
}

pub struct Harness {
    pub store: FakeStore,
    pub links: FakeLinks,
    pub switch: FakeSwitch,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            store: FakeStore::default(),
            links: FakeLinks::default(),
            switch: FakeSwitch::default(),
        }
    }

    /// A driver over the shared fakes, as if the daemon (re)started.
    pub fn driver(&self, clean: bool) -> Driver {
        Driver::new(
            Arc::new(self.store.clone()),
            Arc::new(self.links.clone()),
            Arc::new(self.switch.clone()),
            clean,
        )
    }
}

pub fn create_network_request(
    network_id: &str,
    options: serde_json::Value,
) -> CreateNetworkRequest {
    serde_json::from_value(json!({
        "NetworkID": network_id,
        "Options": { "com.docker.network.generic": options },
        "IPv4Data": [{
            "AddressSpace": "LocalDefault",
            "Pool": "10.0.0.0/24",
            "Gateway": "10.0.0.1/24",
        }],
    }))
    .unwrap()
}

pub fn default_network_request() -> CreateNetworkRequest {
    create_network_request(NETWORK_ID, json!({ "sock": SWITCH }))
}

pub fn create_endpoint_request(endpoint_id: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        network_id: NETWORK_ID.to_string(),
        endpoint_id: endpoint_id.to_string(),
        interface: Some(EndpointInterface {
            address: "10.0.0.2/24".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn join_request(endpoint_id: &str) -> JoinRequest {
    JoinRequest {
        network_id: NETWORK_ID.to_string(),
        endpoint_id: endpoint_id.to_string(),
        sandbox_key: "/var/run/docker/netns/c0ffee".to_string(),
        ..Default::default()
    }
}

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    api::EndpointInterface,
    host::{AttachmentHandle, LinkManager, SwitchClient},
};

/// Characters of the endpoint id appended to the interface prefix.
const DEVICE_ID_CHARS: usize = 11;

/// One container attachment to a network.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointState {
    /// Live switch attachment, zero while detached.
    #[serde(rename = "Plugger")]
    pub attachment: AttachmentHandle,
    /// Host device backing this endpoint.
    #[serde(rename = "IfName")]
    pub device_name: String,
    #[serde(rename = "SandboxKey")]
    pub sandbox_key: String,
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
    #[serde(rename = "IPv6Address")]
    pub ipv6_address: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
}

/// Which step of [`EndpointState::attach`] failed.
#[derive(Debug)]
pub enum AttachError {
    /// No device was created; nothing to undo.
    Device(anyhow::Error),
    /// The device was created, then removed again.
    Switch(anyhow::Error),
}

impl EndpointState {
    pub fn new(endpoint_id: &str, if_prefix: &str, interface: Option<&EndpointInterface>) -> Self {
        let requested = interface.cloned().unwrap_or_default();

        let mac_address = if requested.mac_address.is_empty() {
            random_mac()
        } else {
            requested.mac_address
        };

        EndpointState {
            attachment: AttachmentHandle::UNATTACHED,
            device_name: device_name(if_prefix, endpoint_id),
            sandbox_key: String::new(),
            ipv4_address: requested.address,
            ipv6_address: requested.address_ipv6,
            mac_address,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_attached()
    }

    /// Creates the host device, addresses it and plugs it into the switch.
    ///
    /// On a switch failure the device is removed again and the endpoint is
    /// left detached.
    pub fn attach(
        &mut self,
        switch_address: &str,
        links: &dyn LinkManager,
        switch: &dyn SwitchClient,
    ) -> Result<(), AttachError> {
        links
            .create_device(&self.device_name, &self.mac_address)
            .map_err(AttachError::Device)?;

        for address in [&self.ipv4_address, &self.ipv6_address] {
            if address.is_empty() {
                continue;
            }
            if let Err(e) = links.assign_address(&self.device_name, address) {
                warn!("Failed to assign {address} to {}: {e:#}", self.device_name);
            }
        }

        let attached = switch
            .attach(&self.device_name, switch_address)
            .and_then(|handle| {
                handle
                    .is_attached()
                    .then_some(handle)
                    .ok_or(anyhow::anyhow!("Switch returned an empty handle"))
            });

        match attached {
            Ok(handle) => {
                debug!("Plugged {} to {switch_address} as {handle}", self.device_name);
                self.attachment = handle;
                Ok(())
            }
            Err(e) => {
                if let Err(del) = links.delete_device(&self.device_name) {
                    warn!("Failed to roll back device {}: {del:#}", self.device_name);
                }
                self.attachment = AttachmentHandle::UNATTACHED;
                Err(AttachError::Switch(e))
            }
        }
    }

    /// Unplugs from the switch, then removes the host device. Failures are
    /// logged only.
    pub fn detach(&mut self, links: &dyn LinkManager, switch: &dyn SwitchClient) {
        if self.is_attached() {
            switch.detach(self.attachment);
        }
        self.attachment = AttachmentHandle::UNATTACHED;

        if let Err(e) = links.delete_device(&self.device_name) {
            debug!("Device {} not removed: {e:#}", self.device_name);
        }
    }
}

/// Interface prefix followed by the head of the endpoint id.
pub fn device_name(if_prefix: &str, endpoint_id: &str) -> String {
    let mut name = if_prefix.to_string();
    name.extend(endpoint_id.chars().take(DEVICE_ID_CHARS));
    name
}

/// Random locally administered unicast MAC, as the kernel's
/// `eth_random_addr` builds it.
pub fn random_mac() -> String {
    let mut mac: [u8; 6] = rand::random();
    mac[0] &= 0xfe; // clear multicast bit
    mac[0] |= 0x02; // set local assignment bit

    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

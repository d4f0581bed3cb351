use std::{collections::HashMap, net::IpAddr};

use serde::{Deserialize, Serialize};

use super::endpoint::EndpointState;
use crate::{
    api::CreateNetworkRequest,
    error::{DriverError, DriverResult},
};

/// Prefix used to name devices when the network does not set one.
pub const IF_PREFIX_DEFAULT: &str = "vde";
pub const IF_PREFIX_MAX_LEN: usize = 4;

/// Driver option naming the switch (a VNL, e.g. `vxvde://239.1.2.3`).
pub const OPTION_SOCK: &str = "sock";
/// Driver option overriding the device name prefix.
pub const OPTION_IF_PREFIX: &str = "if";

/// One virtual network, backed by an external switch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkState {
    #[serde(rename = "Sock")]
    pub switch_address: String,
    #[serde(rename = "IfPrefix")]
    pub if_prefix: String,
    #[serde(rename = "IPv4Pool")]
    pub ipv4_pool: String,
    #[serde(rename = "IPv4Gateway")]
    pub ipv4_gateway: String,
    #[serde(rename = "IPv6Pool")]
    pub ipv6_pool: String,
    #[serde(rename = "IPv6Gateway")]
    pub ipv6_gateway: String,
    #[serde(rename = "Endpoints", deserialize_with = "deserialize_nullable_map")]
    pub endpoints: HashMap<String, EndpointState>,
}

/// Every network the driver knows of; this is what gets persisted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Networks {
    #[serde(rename = "Networks", deserialize_with = "deserialize_nullable_map")]
    pub networks: HashMap<String, NetworkState>,
}

impl NetworkState {
    /// Validates a create request into a network without endpoints.
    pub fn from_request(req: &CreateNetworkRequest) -> DriverResult<Self> {
        let Some(ipv4) = req.ipv4_data.first() else {
            return Err(DriverError::invalid_argument("Network IPv4Data config miss."));
        };

        let switch_address = req
            .generic_option(OPTION_SOCK)
            .ok_or(DriverError::not_found("Sock URL miss."))?;

        let if_prefix = req
            .generic_option(OPTION_IF_PREFIX)
            .unwrap_or(IF_PREFIX_DEFAULT);
        if if_prefix.len() > IF_PREFIX_MAX_LEN {
            return Err(DriverError::invalid_argument(
                "Interface prefix exceeds 4 character limit.",
            ));
        }

        let ipv6 = req.ipv6_data.first().cloned().unwrap_or_default();

        Ok(NetworkState {
            switch_address: switch_address.to_string(),
            if_prefix: if_prefix.to_string(),
            ipv4_pool: ipv4.pool.clone(),
            ipv4_gateway: ipv4.gateway.clone(),
            ipv6_pool: ipv6.pool,
            ipv6_gateway: ipv6.gateway,
            endpoints: HashMap::new(),
        })
    }
}

impl Networks {
    pub fn get(&self, network_id: &str) -> DriverResult<&NetworkState> {
        self.networks
            .get(network_id)
            .ok_or(DriverError::not_found("Network not found."))
    }

    pub fn get_mut(&mut self, network_id: &str) -> DriverResult<&mut NetworkState> {
        self.networks
            .get_mut(network_id)
            .ok_or(DriverError::not_found("Network not found."))
    }

    pub fn endpoint(&self, network_id: &str, endpoint_id: &str) -> DriverResult<&EndpointState> {
        self.get(network_id)?
            .endpoints
            .get(endpoint_id)
            .ok_or(DriverError::not_found("Endpoint not found."))
    }

    pub fn endpoint_count(&self) -> usize {
        self.networks.values().map(|n| n.endpoints.len()).sum()
    }

    pub fn to_blob(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// Address part of an `address/mask` gateway, empty when it is not an IP.
pub fn strip_mask(cidr: &str) -> String {
    let address = cidr.split('/').next().unwrap_or_default();

    address
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

fn deserialize_nullable_map<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: Deserialize<'de>,
{
    let map: Option<HashMap<String, V>> = Option::deserialize(deserializer)?;
    Ok(map.unwrap_or_default())
}

//! Wire types for the Docker libnetwork remote driver protocol.
//!
//! The daemon drives both halves of the plugin (IPAM and network driver)
//! with JSON bodies POSTed over the plugin unix socket. Field names on the
//! wire follow the Go conventions of the protocol, so the serde renames
//! here are part of the contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Manifest served from `/Plugin.Activate`.
pub const MANIFEST: &str = r#"{"Implements": ["NetworkDriver","IpamDriver"]}"#;

pub const LOCAL_SCOPE: &str = "local";
pub const GLOBAL_SCOPE: &str = "global";

pub const ACTIVATE_PATH: &str = "/Plugin.Activate";

pub const IPAM_CAPABILITIES_PATH: &str = "/IpamDriver.GetCapabilities";
pub const ADDRESS_SPACES_PATH: &str = "/IpamDriver.GetDefaultAddressSpaces";
pub const REQUEST_POOL_PATH: &str = "/IpamDriver.RequestPool";
pub const RELEASE_POOL_PATH: &str = "/IpamDriver.ReleasePool";
pub const REQUEST_ADDRESS_PATH: &str = "/IpamDriver.RequestAddress";
pub const RELEASE_ADDRESS_PATH: &str = "/IpamDriver.ReleaseAddress";

pub const NET_CAPABILITIES_PATH: &str = "/NetworkDriver.GetCapabilities";
pub const CREATE_NETWORK_PATH: &str = "/NetworkDriver.CreateNetwork";
pub const DELETE_NETWORK_PATH: &str = "/NetworkDriver.DeleteNetwork";
pub const ALLOCATE_NETWORK_PATH: &str = "/NetworkDriver.AllocateNetwork";
pub const FREE_NETWORK_PATH: &str = "/NetworkDriver.FreeNetwork";
pub const CREATE_ENDPOINT_PATH: &str = "/NetworkDriver.CreateEndpoint";
pub const DELETE_ENDPOINT_PATH: &str = "/NetworkDriver.DeleteEndpoint";
pub const ENDPOINT_INFO_PATH: &str = "/NetworkDriver.EndpointOperInfo";
pub const JOIN_PATH: &str = "/NetworkDriver.Join";
pub const LEAVE_PATH: &str = "/NetworkDriver.Leave";
pub const DISCOVER_NEW_PATH: &str = "/NetworkDriver.DiscoverNew";
pub const DISCOVER_DELETE_PATH: &str = "/NetworkDriver.DiscoverDelete";
pub const PROGRAM_EXT_CONN_PATH: &str = "/NetworkDriver.ProgramExternalConnectivity";
pub const REVOKE_EXT_CONN_PATH: &str = "/NetworkDriver.RevokeExternalConnectivity";

/// Error envelope the daemon understands: `{"Err": "<message>"}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { err: msg.into() }
    }
}

/// Capabilities reported by either driver half. The IPAM half only looks at
/// `RequiresMACAddress`; the network half only at the scopes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    #[serde(rename = "RequiresMACAddress")]
    pub requires_mac_address: bool,
    pub scope: String,
    pub connectivity_scope: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressSpacesResponse {
    pub local_default_address_space: String,
    pub global_default_address_space: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestPoolRequest {
    pub address_space: String,
    pub pool: String,
    pub sub_pool: String,
    pub options: HashMap<String, String>,
    #[serde(rename = "V6")]
    pub v6: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPoolResponse {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    pub pool: String,
    pub data: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReleasePoolRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestAddressRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    pub address: String,
    pub options: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestAddressResponse {
    pub address: String,
    pub data: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReleaseAddressRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    pub address: String,
}

/// IPv4 or IPv6 addressing for a network, as allocated by the IPAM driver.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamData {
    pub address_space: String,
    pub pool: String,
    pub gateway: String,
    pub aux_addresses: HashMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    pub options: HashMap<String, Value>,
    #[serde(rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    #[serde(rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AllocateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    pub options: HashMap<String, String>,
    #[serde(rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    #[serde(rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocateNetworkResponse {
    pub options: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FreeNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

/// Interface settings the daemon hands to (or receives from) the driver
/// for an endpoint. Addresses are CIDR strings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointInterface {
    pub address: String,
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    pub mac_address: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    pub interface: Option<EndpointInterface>,
    pub options: HashMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: Option<EndpointInterface>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InfoRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    pub value: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    pub sandbox_key: String,
    pub options: HashMap<String, Value>,
}

/// Name of the interface handed into the sandbox: `SrcName` is the host-side
/// name of the container end, `DstPrefix` the prefix the daemon renames it
/// under inside the namespace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticRoute {
    pub destination: String,
    pub route_type: i32,
    pub next_hop: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    pub gateway: String,
    #[serde(rename = "GatewayIPv6")]
    pub gateway_ipv6: String,
    pub static_routes: Vec<StaticRoute>,
    pub disable_gateway_service: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LeaveRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DiscoveryNotification {
    pub discovery_type: i32,
    pub discovery_data: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProgramExternalConnectivityRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    pub options: HashMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RevokeExternalConnectivityRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let req: CreateNetworkRequest = serde_json::from_str(
            r#"{"NetworkID":"n1","Options":{},"IPv4Data":[{"Pool":"10.0.0.0/24","Gateway":"10.0.0.1/24"}],"IPv6Data":[]}"#,
        )
        .unwrap();
        assert_eq!(req.network_id, "n1");
        assert_eq!(req.ipv4_data[0].pool, "10.0.0.0/24");
        assert_eq!(req.ipv4_data[0].gateway, "10.0.0.1/24");

        let resp = RequestPoolResponse {
            pool_id: "10.0.0.5/32".into(),
            pool: "10.0.0.5/32".into(),
            data: HashMap::new(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["PoolID"], "10.0.0.5/32");
        assert_eq!(json["Pool"], "10.0.0.5/32");
    }

    #[test]
    fn test_requests_tolerate_missing_fields() {
        let req: RequestPoolRequest = serde_json::from_str(r#"{"Pool":""}"#).unwrap();
        assert!(!req.v6);
        assert!(req.options.is_empty());

        let req: CreateEndpointRequest =
            serde_json::from_str(r#"{"NetworkID":"n1","EndpointID":"e1"}"#).unwrap();
        assert!(req.interface.is_none());
    }

    #[test]
    fn test_join_response_shape() {
        let resp = JoinResponse {
            interface_name: InterfaceName {
                src_name: "vi1234abcd".into(),
                dst_prefix: "eth".into(),
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["InterfaceName"]["SrcName"], "vi1234abcd");
        assert_eq!(json["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(json["GatewayIPv6"], "");
        assert_eq!(json["DisableGatewayService"], false);
    }

    #[test]
    fn test_error_envelope() {
        let err = ErrorResponse::new("network n1 exists");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"Err":"network n1 exists"}"#
        );
    }
}

pub mod routes;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tokio::sync::Mutex;
use tracing::{info, warn};

use bgplb_api as api;

use crate::bgp::PathAdvertiser;
use crate::link::{bridge_name, Links};
use crate::runtime::ContainerRuntime;
use crate::store::{PersistedState, Store};
use crate::{Error, Result};

const SENTINEL_V4_POOL: &str = "0.0.0.0/32";
const V6_SUBNET_OPTION: &str = "v6subnet";

/// A container's attachment to one of our networks. Veth names are runtime
/// state, populated by `Join` and never persisted.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub mac_address: String,
    pub veth_inside: String,
    pub veth_outside: String,
    pub address: String,
    pub address_v6: String,
}

#[derive(Clone, Debug)]
pub struct Network {
    pub bridge_name: String,
    pub endpoints: HashMap<String, Endpoint>,
}

impl Network {
    fn new(bridge_name: String) -> Self {
        Self {
            bridge_name,
            endpoints: HashMap::new(),
        }
    }
}

/// The driver state machine behind every RPC. One mutex serialises all
/// access to the network map; each RPC holds it for its whole body. The
/// handle is cheap to clone into detached install jobs, which re-acquire
/// the lock to observe current state rather than capturing references.
pub struct Driver<L, A, R> {
    networks: Arc<Mutex<HashMap<String, Network>>>,
    pub(crate) links: Arc<L>,
    pub(crate) bgp: Arc<A>,
    pub(crate) runtime: Arc<R>,
    store: Arc<Store>,
    scope: String,
}

impl<L, A, R> Clone for Driver<L, A, R> {
    fn clone(&self) -> Self {
        Self {
            networks: self.networks.clone(),
            links: self.links.clone(),
            bgp: self.bgp.clone(),
            runtime: self.runtime.clone(),
            store: self.store.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<L, A, R> Driver<L, A, R>
where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    pub fn new(
        links: Arc<L>,
        bgp: Arc<A>,
        runtime: Arc<R>,
        store: Store,
        scope: impl Into<String>,
        persisted: PersistedState,
    ) -> Self {
        // Endpoint maps always restart empty: the daemon re-drives Join for
        // every live endpoint, which rebuilds the wiring.
        let networks = persisted
            .networks
            .into_keys()
            .map(|id| {
                let bridge = bridge_name(&id);
                (id, Network::new(bridge))
            })
            .collect();
        Self {
            networks: Arc::new(Mutex::new(networks)),
            links,
            bgp,
            runtime,
            store: Arc::new(store),
            scope: scope.into(),
        }
    }

    /// Recreate the bridge for every persisted network. Deterministic names
    /// mean a bridge that survived the restart is simply adopted.
    pub async fn restore(&self) {
        let networks = self.networks.lock().await;
        for id in networks.keys() {
            if let Err(e) = self.links.create_bridge(id, None).await {
                warn!(%e, "could not restore bridge for network {id}");
            }
        }
    }

    pub fn get_ipam_capabilities(&self) -> api::CapabilitiesResponse {
        api::CapabilitiesResponse {
            requires_mac_address: true,
            ..Default::default()
        }
    }

    pub fn get_net_capabilities(&self) -> api::CapabilitiesResponse {
        api::CapabilitiesResponse {
            requires_mac_address: false,
            scope: self.scope.clone(),
            connectivity_scope: self.scope.clone(),
        }
    }

    pub fn get_default_address_spaces(&self) -> api::AddressSpacesResponse {
        api::AddressSpacesResponse {
            local_default_address_space: api::LOCAL_SCOPE.into(),
            global_default_address_space: api::GLOBAL_SCOPE.into(),
        }
    }

    /// The plugin does not allocate: the pool *is* the service address. IPv4
    /// pools must be host-sized (`/32`), with a sentinel for requests that
    /// carry no pool at all; IPv6 pools arrive through the `v6subnet`
    /// option and must be `/128`.
    pub fn request_pool(&self, req: api::RequestPoolRequest) -> Result<api::RequestPoolResponse> {
        let pool = if req.v6 {
            let pool = req
                .options
                .get(V6_SUBNET_OPTION)
                .cloned()
                .unwrap_or_default();
            if pool.is_empty() {
                return Err(Error::InvalidInput(
                    "a v6subnet option is required for IPv6".into(),
                ));
            }
            let net: IpNetwork = pool
                .parse()
                .map_err(|_| Error::InvalidInput(format!("invalid pool {pool}")))?;
            if net.prefix() != 128 {
                return Err(Error::InvalidInput(
                    "only subnet mask /128 is supported".into(),
                ));
            }
            pool
        } else {
            if req.pool.is_empty() {
                SENTINEL_V4_POOL.to_string()
            } else {
                let net: IpNetwork = req
                    .pool
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid pool {}", req.pool)))?;
                if net.prefix() != 32 {
                    return Err(Error::InvalidInput(
                        "only subnet mask /32 is supported".into(),
                    ));
                }
                req.pool
            }
        };
        Ok(api::RequestPoolResponse {
            pool_id: pool.clone(),
            pool,
            data: HashMap::new(),
        })
    }

    /// Every address request is answered with the pool itself; gateway
    /// requests get the same treatment.
    pub fn request_address(
        &self,
        req: api::RequestAddressRequest,
    ) -> api::RequestAddressResponse {
        api::RequestAddressResponse {
            address: req.pool_id,
            data: HashMap::new(),
        }
    }

    pub async fn create_network(&self, req: api::CreateNetworkRequest) -> Result<()> {
        let mut networks = self.networks.lock().await;
        if networks.contains_key(&req.network_id) {
            return Err(Error::NetworkExists(req.network_id));
        }

        let gateway = match req.ipv4_data.first().map(|data| data.gateway.as_str()) {
            Some("") | None => None,
            Some(gateway) => Some(gateway.parse::<IpNetwork>().map_err(|_| {
                Error::InvalidInput(format!("invalid gateway {gateway}"))
            })?),
        };

        let bridge = self.links.create_bridge(&req.network_id, gateway).await?;
        info!("created network {} on bridge {bridge}", req.network_id);
        networks.insert(req.network_id, Network::new(bridge));
        self.store.save(networks.keys())?;
        Ok(())
    }

    pub async fn delete_network(&self, req: api::DeleteNetworkRequest) -> Result<()> {
        let mut networks = self.networks.lock().await;
        if !networks.contains_key(&req.network_id) {
            return Ok(());
        }
        self.links.delete_bridge(&req.network_id).await?;
        networks.remove(&req.network_id);
        self.store.save(networks.keys())?;
        info!("deleted network {}", req.network_id);
        Ok(())
    }

    pub async fn create_endpoint(
        &self,
        req: api::CreateEndpointRequest,
    ) -> Result<api::CreateEndpointResponse> {
        let interface = req.interface.unwrap_or_default();
        {
            let mut networks = self.networks.lock().await;
            let network = networks
                .get_mut(&req.network_id)
                .ok_or_else(|| Error::NetworkNotFound(req.network_id.clone()))?;
            network.endpoints.insert(
                req.endpoint_id.clone(),
                Endpoint {
                    mac_address: interface.mac_address.clone(),
                    address: interface.address.clone(),
                    address_v6: interface.address_ipv6.clone(),
                    ..Default::default()
                },
            );
        }

        // Routes go live asynchronously once the container is ready; the
        // RPC returns as soon as the endpoint is recorded.
        tokio::spawn(routes::install(
            self.clone(),
            req.network_id,
            req.endpoint_id,
            interface.address,
            interface.address_ipv6,
        ));

        // Empty interface back: the caller-supplied address and MAC stand.
        Ok(api::CreateEndpointResponse {
            interface: Some(api::EndpointInterface::default()),
        })
    }

    pub async fn delete_endpoint(&self, req: api::DeleteEndpointRequest) -> Result<()> {
        let mut networks = self.networks.lock().await;
        let Some(network) = networks.get_mut(&req.network_id) else {
            return Ok(());
        };
        network.endpoints.remove(&req.endpoint_id);
        Ok(())
    }

    pub async fn endpoint_info(&self, req: api::InfoRequest) -> Result<api::InfoResponse> {
        let networks = self.networks.lock().await;
        let endpoint = lookup(&networks, &req.network_id, &req.endpoint_id)?;

        let mut value = HashMap::new();
        value.insert("ip_address".to_string(), String::new());
        value.insert("mac_address".to_string(), endpoint.mac_address.clone());
        value.insert("veth_outside".to_string(), endpoint.veth_outside.clone());
        Ok(api::InfoResponse { value })
    }

    pub async fn join(&self, req: api::JoinRequest) -> Result<api::JoinResponse> {
        let mut networks = self.networks.lock().await;
        let (bridge, mac) = {
            let network = networks
                .get(&req.network_id)
                .ok_or_else(|| Error::NetworkNotFound(req.network_id.clone()))?;
            let endpoint = network
                .endpoints
                .get(&req.endpoint_id)
                .ok_or_else(|| Error::EndpointNotFound(req.endpoint_id.clone()))?;
            (network.bridge_name.clone(), endpoint.mac_address.clone())
        };

        let (inside, outside) = self.links.create_veth_pair(&mac).await?;
        self.links.attach_to_bridge(&bridge, &outside).await?;

        if let Some(endpoint) = networks
            .get_mut(&req.network_id)
            .and_then(|n| n.endpoints.get_mut(&req.endpoint_id))
        {
            endpoint.veth_inside = inside.clone();
            endpoint.veth_outside = outside;
        }

        Ok(api::JoinResponse {
            interface_name: api::InterfaceName {
                src_name: inside,
                dst_prefix: "eth".into(),
            },
            ..Default::default()
        })
    }

    /// Routes are drained before the veth pair is unwired, so upstream
    /// convergence strictly precedes container teardown.
    pub async fn leave(&self, req: api::LeaveRequest) -> Result<()> {
        let mut networks = self.networks.lock().await;
        let outside = {
            let endpoint = lookup(&networks, &req.network_id, &req.endpoint_id)?;
            endpoint.veth_outside.clone()
        };

        routes::drain(
            self.links.as_ref(),
            self.bgp.as_ref(),
            &req.network_id,
            &req.endpoint_id,
        )
        .await;

        if !outside.is_empty() {
            self.links.delete_veth_pair(&outside).await?;
        }

        if let Some(endpoint) = networks
            .get_mut(&req.network_id)
            .and_then(|n| n.endpoints.get_mut(&req.endpoint_id))
        {
            endpoint.veth_inside.clear();
            endpoint.veth_outside.clear();
        }
        Ok(())
    }

    // The remaining driver surface exists only to satisfy the protocol.

    pub fn allocate_network(
        &self,
        _req: api::AllocateNetworkRequest,
    ) -> api::AllocateNetworkResponse {
        api::AllocateNetworkResponse::default()
    }

    pub fn free_network(&self, _req: api::FreeNetworkRequest) {}

    pub fn discover_new(&self, _req: api::DiscoveryNotification) {}

    pub fn discover_delete(&self, _req: api::DiscoveryNotification) {}

    pub fn program_external_connectivity(
        &self,
        _req: api::ProgramExternalConnectivityRequest,
    ) {
    }

    pub fn revoke_external_connectivity(&self, _req: api::RevokeExternalConnectivityRequest) {}

    /// Drain every route of an endpoint; entry point for the event watcher.
    pub async fn drain(&self, network_id: &str, endpoint_id: &str) {
        routes::drain(self.links.as_ref(), self.bgp.as_ref(), network_id, endpoint_id).await;
    }

    /// Startup reconciliation: advertise the subnets of labelled networks.
    pub async fn reconcile(self) {
        routes::reconcile(self).await;
    }

    pub async fn endpoint_exists(&self, network_id: &str, endpoint_id: &str) -> bool {
        let networks = self.networks.lock().await;
        networks
            .get(network_id)
            .is_some_and(|n| n.endpoints.contains_key(endpoint_id))
    }

    pub async fn network_ids(&self) -> Vec<String> {
        self.networks.lock().await.keys().cloned().collect()
    }
}

fn lookup<'a>(
    networks: &'a HashMap<String, Network>,
    network_id: &str,
    endpoint_id: &str,
) -> Result<&'a Endpoint> {
    let network = networks
        .get(network_id)
        .ok_or_else(|| Error::NetworkNotFound(network_id.to_string()))?;
    network
        .endpoints
        .get(endpoint_id)
        .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))
}

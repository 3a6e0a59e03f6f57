//! Route lifecycle: the async path from "endpoint created" to "routes
//! live", and the reverse teardown.
//!
//! Ordering is structural and load-bearing: a kernel route is installed
//! before its BGP path is originated, and a path is withdrawn before its
//! kernel route is deleted. Every state the fabric can observe is therefore
//! safe to route through.

use std::time::Duration;

use ipnetwork::IpNetwork;
use tracing::{error, info, warn};

use crate::bgp::PathAdvertiser;
use crate::link::{IpFamily, Links};
use crate::runtime::{ContainerRuntime, Readiness};

use super::Driver;

const READINESS_INITIAL_DELAY: Duration = Duration::from_secs(1);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn host_prefix_len(family: IpFamily) -> u8 {
    match family {
        IpFamily::V4 => 32,
        IpFamily::V6 => 128,
    }
}

/// Detached install job spawned by `CreateEndpoint`. Waits for the backing
/// container to come up, then wires kernel route and BGP path for each
/// requested address. Errors end the job; `Leave` drains whatever made it.
pub(crate) async fn install<L, A, R>(
    driver: Driver<L, A, R>,
    network_id: String,
    endpoint_id: String,
    address: String,
    address_v6: String,
) where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    tokio::time::sleep(READINESS_INITIAL_DELAY).await;
    loop {
        match driver
            .runtime
            .endpoint_readiness(&network_id, &endpoint_id)
            .await
        {
            Ok(Readiness::Ready) => break,
            Ok(Readiness::Pending) => {}
            Ok(Readiness::Failed(reason)) => {
                info!("{reason}, skipping routes for endpoint {endpoint_id}");
                return;
            }
            // Transient daemon trouble; the poll has no deadline, the
            // orchestrator ends it by deleting the endpoint.
            Err(e) => warn!(%e, "could not poll container state for endpoint {endpoint_id}"),
        }
        tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }

    // The endpoint may have been deleted while we were polling; a deleted
    // endpoint gets no routes.
    if !driver.endpoint_exists(&network_id, &endpoint_id).await {
        info!("endpoint {endpoint_id} is gone, skipping routes");
        return;
    }

    let bridge_index = match driver.links.bridge_index(&network_id).await {
        Ok(index) => index,
        Err(e) => {
            error!(%e, "no bridge for network {network_id}, skipping routes");
            return;
        }
    };

    for cidr in [address, address_v6] {
        if cidr.is_empty() {
            continue;
        }
        let dst: IpNetwork = match cidr.parse() {
            Ok(dst) => dst,
            Err(e) => {
                error!(%e, "unparsable endpoint address {cidr}");
                return;
            }
        };
        if let Err(e) = driver.links.add_route(dst, bridge_index).await {
            error!(%e, "could not install kernel route for {cidr}");
            return;
        }
        let host_len = match dst {
            IpNetwork::V4(_) => host_prefix_len(IpFamily::V4),
            IpNetwork::V6(_) => host_prefix_len(IpFamily::V6),
        };
        if let Err(e) = driver.bgp.add_path(dst.ip(), host_len).await {
            error!(%e, "could not advertise {}/{host_len}", dst.ip());
            return;
        }
        info!("advertising {}/{host_len} for endpoint {endpoint_id}", dst.ip());
    }
}

/// Withdraw and remove every route on the network's bridge. Invoked
/// synchronously from `Leave` and from the event watcher on drain signals;
/// reentrant and idempotent. Per-route failures are logged and skipped, so
/// a partial drain still withdraws everything it can.
pub(crate) async fn drain<L, A>(links: &L, bgp: &A, network_id: &str, endpoint_id: &str)
where
    L: Links,
    A: PathAdvertiser,
{
    let bridge_index = match links.bridge_index(network_id).await {
        Ok(index) => index,
        Err(e) => {
            error!(%e, "no bridge for network {network_id}, nothing to drain");
            return;
        }
    };

    for family in [IpFamily::V4, IpFamily::V6] {
        let routes = match links.list_routes(bridge_index, family).await {
            Ok(routes) => routes,
            Err(e) => {
                error!(%e, "could not list {family:?} routes on network {network_id}");
                continue;
            }
        };
        let host_len = host_prefix_len(family);
        for route in routes {
            let ip = route.dst.ip();
            if let Err(e) = bgp.del_path(ip, host_len).await {
                error!(%e, "could not withdraw {ip}/{host_len}");
            }
            if let Err(e) = links.del_route(route).await {
                error!(%e, "could not remove kernel route to {ip}");
            }
        }
    }
    info!("drained routes for endpoint {endpoint_id} on network {network_id}");
}

/// Startup reconciliation: originate the subnet prefixes of every network
/// labelled for advertisement, so the fabric knows the service ranges
/// before any endpoint comes up.
pub(crate) async fn reconcile<L, A, R>(driver: Driver<L, A, R>)
where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    while driver.runtime.ping().await.is_err() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let networks = match driver.runtime.advertised_networks().await {
        Ok(networks) => networks,
        Err(e) => {
            error!(%e, "could not list advertised networks");
            return;
        }
    };
    for network in networks {
        for subnet in network.subnets {
            info!(
                "advertising subnet {subnet} of network {}",
                network.name
            );
            if let Err(e) = driver.bgp.add_path(subnet.ip(), subnet.prefix()).await {
                error!(%e, "could not advertise subnet {subnet}");
            }
        }
    }
}

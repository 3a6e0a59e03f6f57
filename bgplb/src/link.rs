use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::{Handle, IpVersion};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

const BRIDGE_PREFIX: &str = "bgplb-";

/// Derive the bridge name for a network. Stable across restarts and bounded
/// to the kernel's 15-byte interface name limit.
pub fn bridge_name(network_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(network_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", BRIDGE_PREFIX, &digest[..9])
}

/// Allocate a fresh veth name pair: (inside, outside).
fn veth_names() -> (String, String) {
    let suffix = format!("{:08x}", rand::random::<u32>());
    (format!("vi{suffix}"), format!("vo{suffix}"))
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("invalid MAC address {mac}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidInput(format!("invalid MAC address {mac}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidInput(format!("invalid MAC address {mac}")));
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// A kernel route scoped to one of our bridges. Carries the raw netlink
/// message so deletion round-trips exactly what the kernel reported.
#[derive(Clone, Debug)]
pub struct KernelRoute {
    pub dst: IpNetwork,
    pub ifindex: u32,
    message: RouteMessage,
}

impl KernelRoute {
    pub fn new(dst: IpNetwork, ifindex: u32) -> Self {
        Self {
            dst,
            ifindex,
            message: RouteMessage::default(),
        }
    }
}

/// Effect layer over the kernel's link and route tables. No retries; every
/// failure propagates to the caller, which owns compensation.
#[async_trait]
pub trait Links: Send + Sync + 'static {
    /// Create (or adopt) the bridge for a network, optionally assigning the
    /// gateway as its primary address, and bring it up.
    async fn create_bridge(
        &self,
        network_id: &str,
        gateway: Option<IpNetwork>,
    ) -> Result<String>;

    /// Remove the network's bridge. Missing bridge is not an error.
    async fn delete_bridge(&self, network_id: &str) -> Result<()>;

    /// Create a veth pair, set `mac` on the inside end (when non-empty) and
    /// bring the outside end up. Returns (inside, outside) names.
    async fn create_veth_pair(&self, mac: &str) -> Result<(String, String)>;

    async fn attach_to_bridge(&self, bridge: &str, outside: &str) -> Result<()>;

    /// Delete a veth pair by its outside name; the kernel removes the peer
    /// with it. Missing is not an error.
    async fn delete_veth_pair(&self, outside: &str) -> Result<()>;

    async fn bridge_index(&self, network_id: &str) -> Result<u32>;

    async fn add_route(&self, dst: IpNetwork, ifindex: u32) -> Result<()>;

    async fn list_routes(&self, ifindex: u32, family: IpFamily) -> Result<Vec<KernelRoute>>;

    async fn del_route(&self, route: KernelRoute) -> Result<()>;
}

/// rtnetlink-backed implementation.
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn index_of(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(e) if is_errno(&e, libc::ENODEV) || is_errno(&e, libc::ENOENT) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn existing_index(&self, name: &str) -> Result<u32> {
        self.index_of(name)
            .await?
            .ok_or_else(|| Error::Link(format!("link {name} not found")))
    }
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.raw_code() == -errno,
        _ => false,
    }
}

#[async_trait]
impl Links for Netlink {
    async fn create_bridge(
        &self,
        network_id: &str,
        gateway: Option<IpNetwork>,
    ) -> Result<String> {
        let name = bridge_name(network_id);
        match self
            .handle
            .link()
            .add()
            .bridge(name.clone())
            .execute()
            .await
        {
            Ok(()) => debug!("created bridge {name}"),
            // Deterministic naming: a bridge left over from a previous run
            // of the same network is adopted as-is.
            Err(e) if is_errno(&e, libc::EEXIST) => debug!("bridge {name} already present"),
            Err(e) => return Err(e.into()),
        }

        let index = self.existing_index(&name).await?;
        if let Some(gw) = gateway {
            match self
                .handle
                .address()
                .add(index, gw.ip(), gw.prefix())
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if is_errno(&e, libc::EEXIST) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.handle.link().set(index).up().execute().await?;
        Ok(name)
    }

    async fn delete_bridge(&self, network_id: &str) -> Result<()> {
        let name = bridge_name(network_id);
        match self.index_of(&name).await? {
            Some(index) => {
                self.handle.link().del(index).execute().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn create_veth_pair(&self, mac: &str) -> Result<(String, String)> {
        let (inside, outside) = veth_names();
        self.handle
            .link()
            .add()
            .veth(inside.clone(), outside.clone())
            .execute()
            .await?;

        if !mac.is_empty() {
            let addr = parse_mac(mac)?;
            let inside_index = self.existing_index(&inside).await?;
            self.handle
                .link()
                .set(inside_index)
                .address(addr.to_vec())
                .execute()
                .await?;
        }

        let outside_index = self.existing_index(&outside).await?;
        self.handle
            .link()
            .set(outside_index)
            .up()
            .execute()
            .await?;

        Ok((inside, outside))
    }

    async fn attach_to_bridge(&self, bridge: &str, outside: &str) -> Result<()> {
        let bridge_index = self.existing_index(bridge).await?;
        let outside_index = self.existing_index(outside).await?;
        self.handle
            .link()
            .set(outside_index)
            .controller(bridge_index)
            .execute()
            .await?;
        Ok(())
    }

    async fn delete_veth_pair(&self, outside: &str) -> Result<()> {
        match self.index_of(outside).await? {
            Some(index) => {
                self.handle.link().del(index).execute().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn bridge_index(&self, network_id: &str) -> Result<u32> {
        self.existing_index(&bridge_name(network_id)).await
    }

    async fn add_route(&self, dst: IpNetwork, ifindex: u32) -> Result<()> {
        let result = match dst {
            IpNetwork::V4(net) => {
                self.handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(ifindex)
                    .execute()
                    .await
            }
            IpNetwork::V6(net) => {
                self.handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(ifindex)
                    .execute()
                    .await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_routes(&self, ifindex: u32, family: IpFamily) -> Result<Vec<KernelRoute>> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };
        let mut routes = self.handle.route().get(version).execute();
        let mut found = Vec::new();
        while let Some(message) = routes.try_next().await? {
            let Some(oif) = route_oif(&message) else {
                continue;
            };
            if oif != ifindex {
                continue;
            }
            let Some(dst) = route_dst(&message) else {
                continue;
            };
            found.push(KernelRoute {
                dst,
                ifindex: oif,
                message,
            });
        }
        Ok(found)
    }

    async fn del_route(&self, route: KernelRoute) -> Result<()> {
        self.handle.route().del(route.message).execute().await?;
        Ok(())
    }
}

fn route_oif(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_dst(message: &RouteMessage) -> Option<IpNetwork> {
    let prefix_len = message.header.destination_prefix_length;
    message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
            IpNetwork::new(IpAddr::V4(*addr), prefix_len).ok()
        }
        RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
            IpNetwork::new(IpAddr::V6(*addr), prefix_len).ok()
        }
        _ => None,
    })
}

//! In-memory fakes for the driver's effect seams, shared by the driver and
//! coordinator test suites. Ordering-sensitive operations append to a
//! common event log so tests can assert sequencing across seams.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;

use crate::bgp::PathAdvertiser;
use crate::link::{bridge_name, IpFamily, KernelRoute, Links};
use crate::runtime::{AdvertisedNetwork, ContainerRuntime, KillEvent, Readiness};
use crate::{Error, Result};

use super::{Driver, Endpoint};

#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<StdMutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Insert an endpoint record directly, without the install job that
/// `CreateEndpoint` would spawn. For coordinator tests that drive the job
/// by hand.
pub(crate) async fn seed_endpoint<L, A, R>(
    driver: &Driver<L, A, R>,
    network_id: &str,
    endpoint_id: &str,
) where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    let mut networks = driver.networks.lock().await;
    networks
        .get_mut(network_id)
        .expect("network must exist before seeding an endpoint")
        .endpoints
        .insert(endpoint_id.to_string(), Endpoint::default());
}

pub(crate) struct FakeLinks {
    pub log: EventLog,
    pub fail_bridge_create: AtomicBool,
    bridges: StdMutex<HashMap<String, u32>>,
    veths: StdMutex<HashSet<String>>,
    attachments: StdMutex<HashMap<String, String>>,
    routes: StdMutex<Vec<KernelRoute>>,
    next_index: AtomicU32,
    next_veth: AtomicU32,
}

impl FakeLinks {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_bridge_create: AtomicBool::new(false),
            bridges: StdMutex::new(HashMap::new()),
            veths: StdMutex::new(HashSet::new()),
            attachments: StdMutex::new(HashMap::new()),
            routes: StdMutex::new(Vec::new()),
            next_index: AtomicU32::new(1),
            next_veth: AtomicU32::new(1),
        }
    }

    pub fn has_bridge(&self, network_id: &str) -> bool {
        self.bridges
            .lock()
            .unwrap()
            .contains_key(&bridge_name(network_id))
    }

    pub fn has_veth(&self, outside: &str) -> bool {
        self.veths.lock().unwrap().contains(outside)
    }

    pub fn attachment(&self, outside: &str) -> Option<String> {
        self.attachments.lock().unwrap().get(outside).cloned()
    }

    pub fn routes(&self) -> Vec<IpNetwork> {
        self.routes.lock().unwrap().iter().map(|r| r.dst).collect()
    }
}

#[async_trait]
impl Links for FakeLinks {
    async fn create_bridge(
        &self,
        network_id: &str,
        _gateway: Option<IpNetwork>,
    ) -> Result<String> {
        if self.fail_bridge_create.load(Ordering::SeqCst) {
            return Err(Error::Link("bridge create refused".into()));
        }
        let name = bridge_name(network_id);
        let mut bridges = self.bridges.lock().unwrap();
        if !bridges.contains_key(&name) {
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            bridges.insert(name.clone(), index);
        }
        Ok(name)
    }

    async fn delete_bridge(&self, network_id: &str) -> Result<()> {
        self.bridges.lock().unwrap().remove(&bridge_name(network_id));
        Ok(())
    }

    async fn create_veth_pair(&self, _mac: &str) -> Result<(String, String)> {
        let n = self.next_veth.fetch_add(1, Ordering::SeqCst);
        let (inside, outside) = (format!("vi{n}"), format!("vo{n}"));
        self.veths.lock().unwrap().insert(outside.clone());
        Ok((inside, outside))
    }

    async fn attach_to_bridge(&self, bridge: &str, outside: &str) -> Result<()> {
        if !self.bridges.lock().unwrap().contains_key(bridge) {
            return Err(Error::Link(format!("bridge {bridge} not found")));
        }
        if !self.veths.lock().unwrap().contains(outside) {
            return Err(Error::Link(format!("veth {outside} not found")));
        }
        self.attachments
            .lock()
            .unwrap()
            .insert(outside.to_string(), bridge.to_string());
        Ok(())
    }

    async fn delete_veth_pair(&self, outside: &str) -> Result<()> {
        self.veths.lock().unwrap().remove(outside);
        self.attachments.lock().unwrap().remove(outside);
        Ok(())
    }

    async fn bridge_index(&self, network_id: &str) -> Result<u32> {
        self.bridges
            .lock()
            .unwrap()
            .get(&bridge_name(network_id))
            .copied()
            .ok_or_else(|| Error::Link(format!("link {} not found", bridge_name(network_id))))
    }

    async fn add_route(&self, dst: IpNetwork, ifindex: u32) -> Result<()> {
        self.log.push(format!("route-add {dst}"));
        self.routes
            .lock()
            .unwrap()
            .push(KernelRoute::new(dst, ifindex));
        Ok(())
    }

    async fn list_routes(&self, ifindex: u32, family: IpFamily) -> Result<Vec<KernelRoute>> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.ifindex == ifindex)
            .filter(|r| match family {
                IpFamily::V4 => r.dst.is_ipv4(),
                IpFamily::V6 => r.dst.is_ipv6(),
            })
            .cloned()
            .collect())
    }

    async fn del_route(&self, route: KernelRoute) -> Result<()> {
        self.log.push(format!("route-del {}", route.dst));
        self.routes.lock().unwrap().retain(|r| r.dst != route.dst);
        Ok(())
    }
}

pub(crate) struct FakeBgp {
    pub log: EventLog,
    paths: StdMutex<HashSet<(IpAddr, u8)>>,
    announce_count: StdMutex<HashMap<(IpAddr, u8), usize>>,
    withdraw_count: StdMutex<HashMap<(IpAddr, u8), usize>>,
    fail_next_del: AtomicBool,
}

impl FakeBgp {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            paths: StdMutex::new(HashSet::new()),
            announce_count: StdMutex::new(HashMap::new()),
            withdraw_count: StdMutex::new(HashMap::new()),
            fail_next_del: AtomicBool::new(false),
        }
    }

    pub fn has_path(&self, ip: &str, length: u8) -> bool {
        let ip: IpAddr = ip.parse().unwrap();
        self.paths.lock().unwrap().contains(&(ip, length))
    }

    pub fn announces(&self, ip: &str, length: u8) -> usize {
        let ip: IpAddr = ip.parse().unwrap();
        *self
            .announce_count
            .lock()
            .unwrap()
            .get(&(ip, length))
            .unwrap_or(&0)
    }

    pub fn withdraws(&self, ip: &str, length: u8) -> usize {
        let ip: IpAddr = ip.parse().unwrap();
        *self
            .withdraw_count
            .lock()
            .unwrap()
            .get(&(ip, length))
            .unwrap_or(&0)
    }

    pub fn fail_next_del(&self) {
        self.fail_next_del.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PathAdvertiser for FakeBgp {
    async fn add_path(&self, prefix: IpAddr, length: u8) -> Result<()> {
        if self.paths.lock().unwrap().insert((prefix, length)) {
            self.log.push(format!("path-add {prefix}/{length}"));
            *self
                .announce_count
                .lock()
                .unwrap()
                .entry((prefix, length))
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn del_path(&self, prefix: IpAddr, length: u8) -> Result<()> {
        if self.fail_next_del.swap(false, Ordering::SeqCst) {
            return Err(Error::Bgp("peer session busy".into()));
        }
        if self.paths.lock().unwrap().remove(&(prefix, length)) {
            self.log.push(format!("path-del {prefix}/{length}"));
            *self
                .withdraw_count
                .lock()
                .unwrap()
                .entry((prefix, length))
                .or_insert(0) += 1;
        }
        Ok(())
    }
}

pub(crate) struct FakeRuntime {
    script: StdMutex<VecDeque<Readiness>>,
    polls: AtomicUsize,
    advertised: StdMutex<Vec<AdvertisedNetwork>>,
    attachments: StdMutex<HashMap<String, Vec<(String, String)>>>,
    stopped: StdMutex<Vec<String>>,
    event_tx: StdMutex<Option<mpsc::UnboundedSender<Result<KillEvent>>>>,
}

impl FakeRuntime {
    /// Runtime whose containers are immediately ready.
    pub fn ready() -> Self {
        Self {
            script: StdMutex::new(VecDeque::new()),
            polls: AtomicUsize::new(0),
            advertised: StdMutex::new(Vec::new()),
            attachments: StdMutex::new(HashMap::new()),
            stopped: StdMutex::new(Vec::new()),
            event_tx: StdMutex::new(None),
        }
    }

    /// Queue readiness answers; once exhausted, containers read as ready.
    pub fn script(&self, states: Vec<Readiness>) {
        *self.script.lock().unwrap() = states.into();
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn add_advertised_network(&self, name: &str, subnets: Vec<IpNetwork>) {
        self.advertised.lock().unwrap().push(AdvertisedNetwork {
            name: name.to_string(),
            subnets,
        });
    }

    pub fn set_attachments(&self, container_id: &str, pairs: Vec<(String, String)>) {
        self.attachments
            .lock()
            .unwrap()
            .insert(container_id.to_string(), pairs);
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn has_event_subscriber(&self) -> bool {
        self.event_tx.lock().unwrap().is_some()
    }

    pub fn send_event(&self, event: KillEvent) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn endpoint_readiness(
        &self,
        _network_id: &str,
        _endpoint_id: &str,
    ) -> Result<Readiness> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Readiness::Ready))
    }

    async fn advertised_networks(&self) -> Result<Vec<AdvertisedNetwork>> {
        Ok(self.advertised.lock().unwrap().clone())
    }

    async fn container_attachments(
        &self,
        container_id: &str,
    ) -> Result<Vec<(String, String)>> {
        Ok(self
            .attachments
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    fn kill_events(&self) -> BoxStream<'static, Result<KillEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock().unwrap() = Some(tx);
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

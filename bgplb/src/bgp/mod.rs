mod codec;
mod session;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use bgp_rs::AFI;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Everything needed for the single upstream session.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub router_id: Ipv4Addr,
    pub local_as: u32,
    pub peer_address: IpAddr,
    pub peer_as: u32,
    pub peer_password: String,
    pub hold_timer: u16,
}

/// An originated path. Next-hop is always the router ID and the AS path is a
/// single empty sequence, so prefix and length identify the path completely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub prefix: IpAddr,
    pub length: u8,
}

impl PathKey {
    pub fn new(prefix: IpAddr, length: u8) -> Self {
        Self { prefix, length }
    }

    pub fn afi(&self) -> AFI {
        match self.prefix {
            IpAddr::V4(_) => AFI::IPV4,
            IpAddr::V6(_) => AFI::IPV6,
        }
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.length)
    }
}

/// The set of paths we have originated. Authoritative for what the peer
/// should hold; the session re-announces the whole set after every flap.
#[derive(Debug, Default)]
pub struct Rib {
    paths: HashSet<PathKey>,
}

impl Rib {
    /// Returns true if the path was not already present.
    pub fn insert(&mut self, key: PathKey) -> bool {
        self.paths.insert(key)
    }

    /// Returns true if the path was present.
    pub fn remove(&mut self, key: &PathKey) -> bool {
        self.paths.remove(key)
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.paths.contains(key)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PathKey> {
        self.paths.iter().copied().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RibChange {
    Announce(PathKey),
    Withdraw(PathKey),
}

/// Seam for the driver and coordinator: everything they may do to BGP.
#[async_trait]
pub trait PathAdvertiser: Send + Sync + 'static {
    /// Originate a host/subnet route. Re-adding an existing path is a no-op.
    /// Returns once the RIB holds the path, not when the peer has it.
    async fn add_path(&self, prefix: IpAddr, length: u8) -> Result<()>;

    /// Withdraw a path. Deleting an absent path is not an error.
    async fn del_path(&self, prefix: IpAddr, length: u8) -> Result<()>;
}

/// Process-wide BGP state: one local ASN, one router ID, one peer. Built in
/// `main` and injected wherever paths are mutated. The session task owns the
/// socket; `Advertiser` only owns intent.
pub struct Advertiser {
    config: PeerConfig,
    rib: Arc<Mutex<Rib>>,
    changes: mpsc::UnboundedSender<RibChange>,
    pending_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RibChange>>>,
}

impl Advertiser {
    pub fn new(config: PeerConfig) -> Self {
        let (changes, rx) = mpsc::unbounded_channel();
        Self {
            config,
            rib: Arc::new(Mutex::new(Rib::default())),
            changes,
            pending_rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Spawn the peer session loop. The plugin never accepts inbound BGP;
    /// the loop only ever dials out to the configured peer.
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        let rx = self
            .pending_rx
            .lock()
            .expect("advertiser lock poisoned")
            .take()
            .ok_or_else(|| Error::Bgp("advertiser already started".into()))?;
        info!(
            "starting BGP session task: AS{} router-id {} -> {} (AS{})",
            self.config.local_as, self.config.router_id, self.config.peer_address, self.config.peer_as
        );
        tokio::spawn(session::run(
            self.config.clone(),
            self.rib.clone(),
            rx,
            cancel,
        ));
        Ok(())
    }

    pub async fn advertised(&self) -> Vec<PathKey> {
        self.rib.lock().await.snapshot()
    }

    fn notify(&self, change: RibChange) {
        // A dead session task means the process is tearing down; the RIB
        // mutation already happened, which is all callers rely on.
        if self.changes.send(change).is_err() {
            warn!("bgp session task gone, dropping {:?}", change);
        }
    }
}

#[async_trait]
impl PathAdvertiser for Advertiser {
    async fn add_path(&self, prefix: IpAddr, length: u8) -> Result<()> {
        let key = PathKey::new(prefix, length);
        let inserted = self.rib.lock().await.insert(key);
        if inserted {
            self.notify(RibChange::Announce(key));
        }
        Ok(())
    }

    async fn del_path(&self, prefix: IpAddr, length: u8) -> Result<()> {
        let key = PathKey::new(prefix, length);
        let removed = self.rib.lock().await.remove(&key);
        if removed {
            self.notify(RibChange::Withdraw(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> PeerConfig {
        PeerConfig {
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            local_as: 64512,
            peer_address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 254)),
            peer_as: 64513,
            peer_password: "secret".into(),
            hold_timer: 90,
        }
    }

    #[tokio::test]
    async fn test_add_path_is_idempotent() {
        let adv = Advertiser::new(test_config());
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        adv.add_path(ip, 32).await.unwrap();
        adv.add_path(ip, 32).await.unwrap();

        assert_eq!(adv.advertised().await.len(), 1);
    }

    #[tokio::test]
    async fn test_del_absent_path_is_ok() {
        let adv = Advertiser::new(test_config());
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        adv.del_path(ip, 32).await.unwrap();
        assert!(adv.advertised().await.is_empty());

        adv.add_path(ip, 32).await.unwrap();
        adv.del_path(ip, 32).await.unwrap();
        adv.del_path(ip, 32).await.unwrap();
        assert!(adv.advertised().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let adv = Advertiser::new(test_config());
        let cancel = CancellationToken::new();
        adv.start(cancel.child_token()).unwrap();
        assert!(adv.start(cancel.child_token()).is_err());
        cancel.cancel();
    }

    #[test]
    fn test_path_key_family() {
        let v4 = PathKey::new("10.0.0.5".parse().unwrap(), 32);
        assert_eq!(v4.afi(), AFI::IPV4);
        let v6 = PathKey::new("2001:db8::1".parse().unwrap(), 128);
        assert_eq!(v6.afi(), AFI::IPV6);
        assert_eq!(v6.to_string(), "2001:db8::1/128");
    }
}

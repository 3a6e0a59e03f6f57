use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::{
    ASPath, MPReachNLRI, MPUnreachNLRI, Message, NLRIEncoding, Notification, Open, OpenCapability,
    OpenParameter, Origin, PathAttribute, Prefix, Segment, Update, AFI, SAFI,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Instant, Interval};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::MessageCodec;
use super::{PathKey, PeerConfig, Rib, RibChange};

const BGP_PORT: u16 = 179;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// AS-TRANS, RFC 6793 4.2.3.9
const AS_TRANS: u16 = 23456;

type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Session loop owned by the advertiser task. Dials the peer, establishes,
/// replays the full RIB, then streams incremental changes. Any session error
/// tears the connection down and reconnects after a short backoff; the RIB
/// is untouched by flaps, so paths survive them.
pub(super) async fn run(
    config: PeerConfig,
    rib: Arc<Mutex<Rib>>,
    mut changes: mpsc::UnboundedReceiver<RibChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            connected = connect(&config) => match connected {
                Ok(stream) => {
                    // Incremental changes queued while down are superseded
                    // by the full sync the fresh session starts with.
                    while changes.try_recv().is_ok() {}

                    let mut session = Session::new(&config, stream);
                    match session.serve(&rib, &mut changes, &cancel).await {
                        Ok(()) => return,
                        Err(e) => warn!("session with {} ended: {e}", config.peer_address),
                    }
                }
                Err(e) => debug!("connect to {} failed: {e}", config.peer_address),
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn connect(config: &PeerConfig) -> io::Result<TcpStream> {
    let addr = SocketAddr::new(config.peer_address, BGP_PORT);
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if !config.peer_password.is_empty() {
        set_md5_sig(socket.as_raw_fd(), &addr, &config.peer_password)?;
    }
    socket.connect(addr).await
}

// struct tcp_md5sig from linux/tcp.h
#[repr(C)]
struct TcpMd5Sig {
    addr: libc::sockaddr_storage,
    flags: u8,
    prefix_len: u8,
    key_len: u16,
    ifindex: libc::c_int,
    key: [u8; 80],
}

/// Arm TCP MD5 signatures (RFC 2385) for the peer before connecting.
fn set_md5_sig(fd: i32, peer: &SocketAddr, password: &str) -> io::Result<()> {
    if password.len() > 80 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TCP MD5 password longer than 80 bytes",
        ));
    }
    let mut sig: TcpMd5Sig = unsafe { std::mem::zeroed() };
    match peer.ip() {
        IpAddr::V4(v4) => {
            let sin = &mut sig.addr as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.octets()),
                };
            }
        }
        IpAddr::V6(v6) => {
            let sin6 = &mut sig.addr as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_addr.s6_addr = v6.octets();
            }
        }
    }
    sig.key_len = password.len() as u16;
    sig.key[..password.len()].copy_from_slice(password.as_bytes());

    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MD5SIG,
            &sig as *const TcpMd5Sig as *const libc::c_void,
            std::mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum SessionState {
    OpenSent,
    OpenConfirm,
    Established,
}

#[derive(Debug, thiserror::Error)]
pub(super) enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("hold time expired")]
    HoldTimeExpired,

    #[error("open ASN mismatch (received={0}, expected={1})")]
    OpenAsnMismatch(u32, u32),

    #[error("notification from peer: code {0}/{1}")]
    PeerNotification(u8, u8),
}

struct Session {
    config: PeerConfig,
    state: SessionState,
    protocol: MessageProtocol,
    hold_timer: HoldTimer,
    synced: bool,
}

impl Session {
    fn new(config: &PeerConfig, stream: TcpStream) -> Self {
        Self {
            config: config.clone(),
            state: SessionState::OpenSent,
            protocol: Framed::new(stream, MessageCodec::new()),
            hold_timer: HoldTimer::new(config.hold_timer),
            synced: false,
        }
    }

    async fn serve(
        &mut self,
        rib: &Arc<Mutex<Rib>>,
        changes: &mut mpsc::UnboundedReceiver<RibChange>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.send_message(Message::Open(create_open(&self.config)))
            .await?;

        loop {
            if self.state == SessionState::Established && !self.synced {
                let paths = rib.lock().await.snapshot();
                info!(
                    "session with {} established, announcing {} path(s)",
                    self.config.peer_address,
                    paths.len()
                );
                for key in paths {
                    self.send_message(Message::Update(announce_update(
                        self.config.router_id,
                        key,
                    )))
                    .await?;
                }
                self.synced = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cease / peer de-configured; best effort on the way out.
                    let _ = self.send_message(Message::Notification(Notification {
                        major_err_code: 6,
                        minor_err_code: 3,
                        data: vec![],
                    })).await;
                    return Ok(());
                },
                change = changes.recv(), if self.state == SessionState::Established && self.synced => {
                    match change {
                        Some(RibChange::Announce(key)) => {
                            debug!("announcing {key} to {}", self.config.peer_address);
                            self.send_message(Message::Update(announce_update(
                                self.config.router_id,
                                key,
                            )))
                            .await?;
                        }
                        Some(RibChange::Withdraw(key)) => {
                            debug!("withdrawing {key} from {}", self.config.peer_address);
                            self.send_message(Message::Update(withdraw_update(key))).await?;
                        }
                        None => return Ok(()),
                    }
                },
                message = self.protocol.next() => {
                    match message {
                        None => return Err(SessionError::Closed),
                        Some(Ok(message)) => {
                            self.hold_timer.received();
                            self.process_message(message).await?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                    }
                },
                keepalive = self.hold_timer.should_send_keepalive() => {
                    if keepalive? {
                        self.send_message(Message::KeepAlive).await?;
                    }
                },
            }
        }
    }

    async fn process_message(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Open(open) => {
                let remote_asn = asn_from_open(&open);
                if remote_asn != self.config.peer_as {
                    let _ = self
                        .send_message(Message::Notification(Notification {
                            major_err_code: 2, // OPEN error
                            minor_err_code: 2, // bad peer AS
                            data: vec![],
                        }))
                        .await;
                    return Err(SessionError::OpenAsnMismatch(remote_asn, self.config.peer_as));
                }
                let negotiated = open.hold_timer.min(self.config.hold_timer);
                self.hold_timer = HoldTimer::new(negotiated);
                self.state = SessionState::OpenConfirm;
                self.send_message(Message::KeepAlive).await?;
            }
            Message::KeepAlive => {
                if self.state == SessionState::OpenConfirm {
                    self.state = SessionState::Established;
                }
            }
            Message::Update(_) => {
                // Advertise-only session; learned routes are not installed.
            }
            Message::Notification(notification) => {
                return Err(SessionError::PeerNotification(
                    notification.major_err_code,
                    notification.minor_err_code,
                ));
            }
            Message::RouteRefresh(_) => {
                // Peer asked for our routes again.
                self.synced = false;
            }
        }
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> Result<(), io::Error> {
        self.protocol.send(message).await?;
        self.hold_timer.sent();
        Ok(())
    }
}

fn create_open(config: &PeerConfig) -> Open {
    let capabilities = vec![
        OpenCapability::MultiProtocol((AFI::IPV4, SAFI::Unicast)),
        OpenCapability::MultiProtocol((AFI::IPV6, SAFI::Unicast)),
        OpenCapability::FourByteASN(config.local_as),
    ];
    let two_byte_asn = if config.local_as < u32::from(u16::MAX) {
        config.local_as as u16
    } else {
        AS_TRANS
    };
    Open {
        version: 4,
        peer_asn: two_byte_asn,
        hold_timer: config.hold_timer,
        identifier: u32::from_be_bytes(config.router_id.octets()),
        parameters: vec![OpenParameter::Capabilities(capabilities)],
    }
}

/// Check 4-byte ASN first, fallback to 2-byte.
fn asn_from_open(open: &Open) -> u32 {
    open.parameters
        .iter()
        .flat_map(|p| match p {
            OpenParameter::Capabilities(caps) => caps.clone(),
            _ => vec![],
        })
        .find_map(|c| match c {
            OpenCapability::FourByteASN(asn) => Some(asn),
            _ => None,
        })
        .unwrap_or_else(|| u32::from(open.peer_asn))
}

fn nlri_for(key: PathKey) -> NLRIEncoding {
    let (protocol, octets) = match key.prefix {
        IpAddr::V4(v4) => (AFI::IPV4, v4.octets().to_vec()),
        IpAddr::V6(v6) => (AFI::IPV6, v6.octets().to_vec()),
    };
    NLRIEncoding::IP(Prefix {
        protocol,
        length: key.length,
        prefix: octets,
    })
}

/// Origin IGP, an empty AS_SEQUENCE and the router ID as next-hop; the
/// upstream ECMP fabric needs nothing more from us.
fn announce_update(router_id: Ipv4Addr, key: PathKey) -> Update {
    let mut attributes = vec![
        PathAttribute::ORIGIN(Origin::IGP),
        PathAttribute::AS_PATH(ASPath {
            segments: vec![Segment::AS_SEQUENCE(vec![])],
        }),
    ];
    let mut announced_routes = Vec::with_capacity(1);
    match key.afi() {
        AFI::IPV4 => {
            attributes.push(PathAttribute::NEXT_HOP(IpAddr::V4(router_id)));
            announced_routes.push(nlri_for(key));
        }
        _ => {
            attributes.push(PathAttribute::MP_REACH_NLRI(MPReachNLRI {
                afi: AFI::IPV6,
                safi: SAFI::Unicast,
                next_hop: router_id.octets().to_vec(),
                announced_routes: vec![nlri_for(key)],
            }));
        }
    }
    Update {
        withdrawn_routes: Vec::new(),
        attributes,
        announced_routes,
    }
}

fn withdraw_update(key: PathKey) -> Update {
    match key.afi() {
        AFI::IPV4 => Update {
            withdrawn_routes: vec![nlri_for(key)],
            attributes: Vec::new(),
            announced_routes: Vec::new(),
        },
        _ => Update {
            withdrawn_routes: Vec::new(),
            attributes: vec![PathAttribute::MP_UNREACH_NLRI(MPUnreachNLRI {
                afi: AFI::IPV6,
                safi: SAFI::Unicast,
                withdrawn_routes: vec![nlri_for(key)],
            })],
            announced_routes: Vec::new(),
        },
    }
}

/// Keepalive pacing and expiry, at a third of the negotiated hold time.
struct HoldTimer {
    hold_time: Duration,
    interval: Duration,
    timer: Interval,
    last_sent: Instant,
    last_received: Instant,
}

impl HoldTimer {
    fn new(hold_timer: u16) -> Self {
        Self {
            hold_time: Duration::from_secs(u64::from(hold_timer)),
            interval: Duration::from_secs(u64::from(hold_timer / 3)),
            timer: interval(Duration::from_millis(100)),
            last_sent: Instant::now(),
            last_received: Instant::now(),
        }
    }

    // Resolves on every tick; true when the remaining hold time has dropped
    // below two keepalive intervals.
    async fn should_send_keepalive(&mut self) -> Result<bool, SessionError> {
        self.timer.tick().await;
        if self.last_received.elapsed() >= self.hold_time {
            return Err(SessionError::HoldTimeExpired);
        }
        let remaining = self.hold_time.saturating_sub(self.last_sent.elapsed());
        Ok(remaining < self.interval * 2)
    }

    fn received(&mut self) {
        self.last_received = Instant::now();
    }

    fn sent(&mut self) {
        self.last_sent = Instant::now();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_open_small_asn() {
        let config = PeerConfig {
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            local_as: 64512,
            peer_address: "192.0.2.254".parse().unwrap(),
            peer_as: 64513,
            peer_password: String::new(),
            hold_timer: 90,
        };
        let open = create_open(&config);
        assert_eq!(open.version, 4);
        assert_eq!(open.peer_asn, 64512);
        assert_eq!(open.identifier, u32::from_be_bytes([192, 0, 2, 1]));
    }

    #[test]
    fn test_create_open_large_asn_uses_as_trans() {
        let config = PeerConfig {
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            local_as: 4_200_000_000,
            peer_address: "192.0.2.254".parse().unwrap(),
            peer_as: 64513,
            peer_password: String::new(),
            hold_timer: 90,
        };
        let open = create_open(&config);
        assert_eq!(open.peer_asn, AS_TRANS);
        assert_eq!(asn_from_open(&open), 4_200_000_000);
    }

    #[test]
    fn test_announce_v4_carries_next_hop() {
        let router_id = Ipv4Addr::new(192, 0, 2, 1);
        let key = PathKey::new("10.0.0.5".parse().unwrap(), 32);
        let update = announce_update(router_id, key);

        assert_eq!(update.announced_routes.len(), 1);
        assert!(update.withdrawn_routes.is_empty());
        assert!(update.attributes.iter().any(|a| matches!(
            a,
            PathAttribute::NEXT_HOP(IpAddr::V4(nh)) if *nh == router_id
        )));
        assert!(update
            .attributes
            .iter()
            .any(|a| matches!(a, PathAttribute::ORIGIN(Origin::IGP))));
        // Empty AS_SEQUENCE segment.
        assert!(update.attributes.iter().any(|a| matches!(
            a,
            PathAttribute::AS_PATH(path)
                if matches!(path.segments.as_slice(), [Segment::AS_SEQUENCE(seq)] if seq.is_empty())
        )));
    }

    #[test]
    fn test_announce_v6_uses_mp_reach() {
        let router_id = Ipv4Addr::new(192, 0, 2, 1);
        let key = PathKey::new("2001:db8::1".parse().unwrap(), 128);
        let update = announce_update(router_id, key);

        assert!(update.announced_routes.is_empty());
        assert!(update.attributes.iter().any(|a| matches!(
            a,
            PathAttribute::MP_REACH_NLRI(mp)
                if mp.afi == AFI::IPV6 && mp.announced_routes.len() == 1
        )));
    }

    #[test]
    fn test_withdraw_updates() {
        let v4 = withdraw_update(PathKey::new("10.0.0.5".parse().unwrap(), 32));
        assert_eq!(v4.withdrawn_routes.len(), 1);
        assert!(v4.announced_routes.is_empty());

        let v6 = withdraw_update(PathKey::new("2001:db8::1".parse().unwrap(), 128));
        assert!(v6.withdrawn_routes.is_empty());
        assert!(v6.attributes.iter().any(|a| matches!(
            a,
            PathAttribute::MP_UNREACH_NLRI(mp) if mp.withdrawn_routes.len() == 1
        )));
    }

    #[tokio::test]
    async fn test_hold_timer_expiry() {
        tokio::time::pause();
        let mut timer = HoldTimer::new(9);
        assert!(!timer.should_send_keepalive().await.unwrap());

        // Two keepalive intervals without sending: time to send again.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(timer.should_send_keepalive().await.unwrap());
        timer.sent();

        // Nothing received for the whole hold time: expired.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(timer.should_send_keepalive().await.is_err());
    }
}

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

use bgplb_api::{GLOBAL_SCOPE, LOCAL_SCOPE};

/// Runtime configuration, sourced from the environment the way the plugin
/// is deployed (a managed plugin container gets no argv worth speaking of).
#[derive(Parser, Debug, Clone)]
#[command(version, about = "BGP ECMP load-balancer plugin for Docker", long_about = None)]
pub struct Config {
    /// BGP router ID, also used as next-hop for every originated path
    #[arg(long, env = "ROUTER_ID")]
    pub router_id: Ipv4Addr,

    /// Local autonomous system number
    #[arg(long, env = "LOCAL_AS")]
    pub local_as: u32,

    /// Address of the single upstream BGP peer
    #[arg(long, env = "PEER_ADDRESS")]
    pub peer_address: IpAddr,

    /// Peer autonomous system number
    #[arg(long, env = "PEER_AS")]
    pub peer_as: u32,

    /// TCP MD5 password for the peer session
    #[arg(long, env = "PEER_PASSWORD")]
    pub peer_password: String,

    /// Report "global" scope to the daemon instead of "local"
    #[arg(long, env = "GLOBAL_SCOPE")]
    pub global_scope: bool,

    /// Watch for kill events and drain routes on the configured signal
    #[arg(long, env = "SIGUSR2_HANDLER")]
    pub sigusr2_handler: bool,

    /// Plugin socket the daemon connects to
    #[arg(long, env = "PLUGIN_SOCKET", default_value = "/run/docker/plugins/bgplb.sock")]
    pub socket_path: PathBuf,

    /// Persistent driver state
    #[arg(long, env = "STATE_FILE", default_value = "/bgplb.json")]
    pub state_file: PathBuf,

    /// BGP hold timer in seconds, keepalives at a third of this
    #[arg(long, env = "BGP_HOLD_TIMER", default_value_t = 90)]
    pub hold_timer: u16,

    /// Numeric signal that triggers a route drain (12 = SIGUSR2)
    #[arg(long, env = "DRAIN_SIGNAL", default_value = "12")]
    pub drain_signal: String,

    /// Seconds to wait between draining routes and stopping the container
    #[arg(long, env = "DRAIN_DELAY", default_value_t = 5)]
    pub drain_delay_secs: u64,

    /// Driver name as registered with the daemon, used to find our networks
    #[arg(long, env = "DRIVER_NAME", default_value = "bgplb:latest")]
    pub driver_name: String,
}

impl Config {
    pub fn scope(&self) -> &'static str {
        if self.global_scope {
            GLOBAL_SCOPE
        } else {
            LOCAL_SCOPE
        }
    }
}

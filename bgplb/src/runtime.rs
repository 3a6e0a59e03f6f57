use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bollard::container::StopContainerOptions;
use bollard::models::{ContainerStateStatusEnum, HealthStatusEnum};
use bollard::network::ListNetworksOptions;
use bollard::system::EventsOptions;
use futures::stream::{BoxStream, StreamExt};
use ipnetwork::IpNetwork;
use tracing::warn;

use crate::Result;

/// Label that opts a network's subnets into startup advertisement.
pub const ADVERTISE_LABEL: &str = "bgplb_advertise=true";

/// Where the container backing an endpoint is in its lifecycle, as far as
/// route installation cares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Healthy, or running without a healthcheck: routes may go live.
    Ready,
    /// Still starting; poll again.
    Pending,
    /// Will never become ready (unhealthy, failed to start, or the network
    /// has no containers). Carries the reason for the log line.
    Failed(String),
}

/// A network whose subnets are originated at startup.
#[derive(Clone, Debug)]
pub struct AdvertisedNetwork {
    pub name: String,
    pub subnets: Vec<IpNetwork>,
}

#[derive(Clone, Debug)]
pub struct KillEvent {
    pub container_id: String,
    pub signal: String,
}

/// The container orchestrator as the plugin sees it: state polls, network
/// listings and the kill-event stream. Implemented against the Docker
/// Engine API; faked in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Reachability probe, used to hold off work until the daemon is up.
    async fn ping(&self) -> Result<()>;

    /// Poll the container backing `endpoint_id` on `network_id`.
    async fn endpoint_readiness(&self, network_id: &str, endpoint_id: &str)
        -> Result<Readiness>;

    /// Networks labelled `bgplb_advertise=true`, with their IPAM subnets.
    async fn advertised_networks(&self) -> Result<Vec<AdvertisedNetwork>>;

    /// (network, endpoint) pairs the container holds on networks driven by
    /// this plugin.
    async fn container_attachments(&self, container_id: &str)
        -> Result<Vec<(String, String)>>;

    /// Stop a container with the runtime's default signal and no timeout.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Subscribe to `kill` events.
    fn kill_events(&self) -> BoxStream<'static, Result<KillEvent>>;
}

/// Docker Engine API client over the local unix socket.
pub struct Docker {
    client: bollard::Docker,
    driver_name: String,
}

impl Docker {
    pub fn new(driver_name: impl Into<String>) -> Result<Self> {
        let client = bollard::Docker::connect_with_unix_defaults()?;
        Ok(Self {
            client,
            driver_name: driver_name.into(),
        })
    }

    async fn networks_with_filter(&self, key: &str, value: &str) -> Result<Vec<bollard::models::Network>> {
        let mut filters = HashMap::new();
        filters.insert(key.to_string(), vec![value.to_string()]);
        Ok(self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?)
    }
}

#[async_trait]
impl ContainerRuntime for Docker {
    async fn ping(&self) -> Result<()> {
        self.client.version().await?;
        Ok(())
    }

    async fn endpoint_readiness(
        &self,
        network_id: &str,
        endpoint_id: &str,
    ) -> Result<Readiness> {
        let network = self
            .client
            .inspect_network(
                network_id,
                None::<bollard::network::InspectNetworkOptions<String>>,
            )
            .await?;
        let containers = network.containers.unwrap_or_default();
        if containers.is_empty() {
            return Ok(Readiness::Failed(format!(
                "no containers found on network {network_id}"
            )));
        }

        for (container_id, attachment) in containers {
            if attachment.endpoint_id.as_deref() != Some(endpoint_id) {
                continue;
            }
            let inspect = self.client.inspect_container(&container_id, None).await?;
            let Some(state) = inspect.state else {
                return Ok(Readiness::Pending);
            };

            // A declared healthcheck takes precedence over the bare
            // running state.
            if let Some(health) = state.health.and_then(|h| h.status) {
                match health {
                    HealthStatusEnum::HEALTHY => return Ok(Readiness::Ready),
                    HealthStatusEnum::UNHEALTHY => {
                        return Ok(Readiness::Failed(format!(
                            "container {container_id} is unhealthy"
                        )));
                    }
                    HealthStatusEnum::STARTING => return Ok(Readiness::Pending),
                    HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => {}
                }
            }

            if state.running == Some(true) {
                return Ok(Readiness::Ready);
            }
            return Ok(match state.status {
                Some(ContainerStateStatusEnum::CREATED) | None => Readiness::Pending,
                Some(status) => Readiness::Failed(format!(
                    "container {container_id} failed to start ({status:?})"
                )),
            });
        }

        // The endpoint has not been wired to a container yet.
        Ok(Readiness::Pending)
    }

    async fn advertised_networks(&self) -> Result<Vec<AdvertisedNetwork>> {
        let networks = self.networks_with_filter("label", ADVERTISE_LABEL).await?;
        let mut found = Vec::with_capacity(networks.len());
        for network in networks {
            let name = network.name.unwrap_or_default();
            let mut subnets = Vec::new();
            for config in network
                .ipam
                .and_then(|ipam| ipam.config)
                .unwrap_or_default()
            {
                let Some(subnet) = config.subnet else { continue };
                match subnet.parse::<IpNetwork>() {
                    Ok(net) => subnets.push(net),
                    Err(e) => warn!(%e, "skipping unparsable subnet {subnet} on network {name}"),
                }
            }
            found.push(AdvertisedNetwork { name, subnets });
        }
        Ok(found)
    }

    async fn container_attachments(
        &self,
        container_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let ours: HashSet<String> = self
            .networks_with_filter("driver", &self.driver_name)
            .await?
            .into_iter()
            .filter_map(|n| n.id)
            .collect();

        let inspect = self.client.inspect_container(container_id, None).await?;
        let attached = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        Ok(attached
            .into_values()
            .filter_map(|endpoint| {
                let network_id = endpoint.network_id?;
                let endpoint_id = endpoint.endpoint_id?;
                ours.contains(&network_id)
                    .then_some((network_id, endpoint_id))
            })
            .collect())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.client
            .stop_container(container_id, Some(StopContainerOptions { t: -1 }))
            .await?;
        Ok(())
    }

    fn kill_events(&self) -> BoxStream<'static, Result<KillEvent>> {
        let mut filters = HashMap::new();
        filters.insert("event".to_string(), vec!["kill".to_string()]);
        self.client
            .events(Some(EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            }))
            .map(|event| {
                let event = event?;
                let actor = event.actor.unwrap_or_default();
                let signal = actor
                    .attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get("signal"))
                    .cloned()
                    .unwrap_or_default();
                Ok(KillEvent {
                    container_id: actor.id.unwrap_or_default(),
                    signal,
                })
            })
            .boxed()
    }
}

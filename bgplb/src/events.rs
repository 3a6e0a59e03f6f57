//! Graceful-drain watcher: containers signal intent to stop (SIGUSR2 by
//! convention), we withdraw their routes, give upstream a moment to
//! converge, then ask the runtime to stop them for real.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bgp::PathAdvertiser;
use crate::driver::Driver;
use crate::link::Links;
use crate::runtime::ContainerRuntime;

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct WatcherConfig {
    /// Numeric signal value carried by the kill event, e.g. "12".
    pub drain_signal: String,
    /// Quiescence window between drain and stop.
    pub drain_delay: Duration,
}

/// Consume the runtime's kill-event stream until cancelled. Transport
/// errors back off for a second and resubscribe.
pub async fn watch<L, A, R>(
    driver: Driver<L, A, R>,
    config: WatcherConfig,
    cancel: CancellationToken,
) where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    // The runtime may still be booting alongside us.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            ping = driver.runtime.ping() => match ping {
                Ok(()) => break,
                Err(_) => tokio::time::sleep(STREAM_RETRY_DELAY).await,
            },
        }
    }
    info!(
        "watching for kill events with signal {}",
        config.drain_signal
    );

    loop {
        let mut events = driver.runtime.kill_events();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if event.signal == config.drain_signal {
                            tokio::spawn(drain_and_stop(
                                driver.clone(),
                                event.container_id,
                                config.drain_delay,
                            ));
                        }
                    }
                    Some(Err(e)) => {
                        error!(%e, "event stream error");
                        break;
                    }
                    None => {
                        error!("event stream closed");
                        break;
                    }
                },
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(STREAM_RETRY_DELAY) => {}
        }
    }
}

async fn drain_and_stop<L, A, R>(driver: Driver<L, A, R>, container_id: String, delay: Duration)
where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    info!("drain signal received from container {container_id}, withdrawing routes");
    match driver.runtime.container_attachments(&container_id).await {
        Ok(attachments) => {
            for (network_id, endpoint_id) in attachments {
                driver.drain(&network_id, &endpoint_id).await;
            }
        }
        Err(e) => error!(%e, "could not resolve networks of container {container_id}"),
    }

    // Let the fabric converge away from this host before the workload dies.
    tokio::time::sleep(delay).await;

    if let Err(e) = driver.runtime.stop_container(&container_id).await {
        error!(%e, "could not stop container {container_id}");
    }
}

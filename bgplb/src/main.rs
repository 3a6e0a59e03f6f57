use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bgplb::bgp::{Advertiser, PeerConfig};
use bgplb::config::Config;
use bgplb::driver::Driver;
use bgplb::events::{self, WatcherConfig};
use bgplb::http;
use bgplb::link::Netlink;
use bgplb::runtime::Docker;
use bgplb::store::Store;
use bgplb::Result;

#[tokio::main]
async fn main() -> Result<()> {
    setup_subscriber();
    let config = Config::parse();
    if config.peer_password.is_empty() {
        error!("environment variable PEER_PASSWORD is required");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();

    info!("starting BGP server");
    let advertiser = Arc::new(Advertiser::new(PeerConfig {
        router_id: config.router_id,
        local_as: config.local_as,
        peer_address: config.peer_address,
        peer_as: config.peer_as,
        peer_password: config.peer_password.clone(),
        hold_timer: config.hold_timer,
    }));
    advertiser.start(cancel.child_token())?;

    let links = Arc::new(Netlink::new()?);
    let runtime = Arc::new(Docker::new(&config.driver_name)?);
    let store = Store::new(&config.state_file);
    let persisted = store.load();
    let driver = Driver::new(
        links,
        advertiser,
        runtime,
        store,
        config.scope(),
        persisted,
    );
    driver.restore().await;

    tokio::spawn(driver.clone().reconcile());

    if config.sigusr2_handler {
        tokio::spawn(events::watch(
            driver.clone(),
            WatcherConfig {
                drain_signal: config.drain_signal.clone(),
                drain_delay: Duration::from_secs(config.drain_delay_secs),
            },
            cancel.child_token(),
        ));
    }

    info!("starting bgplb plugin");
    let app = http::router(driver);
    let socket_path = config.socket_path.clone();
    let serve_cancel = cancel.child_token();
    let mut serve_handle =
        tokio::spawn(async move { http::serve(&socket_path, app, serve_cancel).await });
    let mut shutdown_handle = tokio::spawn(shutdown_signal());

    tokio::select! {
        h = &mut serve_handle => exit("plugin server", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            if let Err(e) = serve_handle.await {
                error!("plugin server exited with error: {}", e.to_string());
            }
        },
    };
    info!("Exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bgplb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}

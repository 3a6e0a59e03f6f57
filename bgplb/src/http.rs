//! Thin demultiplexer between the daemon and the driver state machine.
//! Bodies are decoded by hand so a malformed request short-circuits into
//! the protocol's error envelope without touching the driver.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bgplb_api as api;

use crate::bgp::PathAdvertiser;
use crate::driver::Driver;
use crate::link::Links;
use crate::runtime::ContainerRuntime;
use crate::{Error, Result};

const CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

pub fn router<L, A, R>(driver: Driver<L, A, R>) -> Router
where
    L: Links,
    A: PathAdvertiser,
    R: ContainerRuntime,
{
    Router::new()
        .route(api::ACTIVATE_PATH, post(activate))
        .route(api::IPAM_CAPABILITIES_PATH, post(ipam_capabilities::<L, A, R>))
        .route(api::ADDRESS_SPACES_PATH, post(address_spaces::<L, A, R>))
        .route(api::REQUEST_POOL_PATH, post(request_pool::<L, A, R>))
        .route(api::RELEASE_POOL_PATH, post(release_pool))
        .route(api::REQUEST_ADDRESS_PATH, post(request_address::<L, A, R>))
        .route(api::RELEASE_ADDRESS_PATH, post(release_address))
        .route(api::NET_CAPABILITIES_PATH, post(net_capabilities::<L, A, R>))
        .route(api::CREATE_NETWORK_PATH, post(create_network::<L, A, R>))
        .route(api::DELETE_NETWORK_PATH, post(delete_network::<L, A, R>))
        .route(api::ALLOCATE_NETWORK_PATH, post(allocate_network::<L, A, R>))
        .route(api::FREE_NETWORK_PATH, post(free_network::<L, A, R>))
        .route(api::CREATE_ENDPOINT_PATH, post(create_endpoint::<L, A, R>))
        .route(api::DELETE_ENDPOINT_PATH, post(delete_endpoint::<L, A, R>))
        .route(api::ENDPOINT_INFO_PATH, post(endpoint_info::<L, A, R>))
        .route(api::JOIN_PATH, post(join::<L, A, R>))
        .route(api::LEAVE_PATH, post(leave::<L, A, R>))
        .route(api::DISCOVER_NEW_PATH, post(discover_new::<L, A, R>))
        .route(api::DISCOVER_DELETE_PATH, post(discover_delete::<L, A, R>))
        .route(api::PROGRAM_EXT_CONN_PATH, post(program_ext_conn::<L, A, R>))
        .route(api::REVOKE_EXT_CONN_PATH, post(revoke_ext_conn::<L, A, R>))
        .with_state(driver)
}

/// Bind the plugin socket and serve until cancelled. A stale socket from a
/// previous run is unlinked first.
pub async fn serve(path: &Path, router: Router, cancel: CancellationToken) -> Result<()> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    let parent = path.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of socket path {} could not resolve", path.display()),
        ))
    })?;
    fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(path)?;
    info!("plugin listening on {}", path.display());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidInput(format!("invalid request body: {e}")))
}

fn reply<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => plugin_json(StatusCode::OK, &value),
        Err(e) => plugin_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &api::ErrorResponse::new(e.to_string()),
        ),
    }
}

fn plugin_json<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    (status, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

async fn activate() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        api::MANIFEST,
    )
        .into_response()
}

type DriverState<L, A, R> = State<Driver<L, A, R>>;

async fn ipam_capabilities<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
) -> Response {
    reply(Ok(driver.get_ipam_capabilities()))
}

async fn net_capabilities<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
) -> Response {
    reply(Ok(driver.get_net_capabilities()))
}

async fn address_spaces<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
) -> Response {
    reply(Ok(driver.get_default_address_spaces()))
}

async fn request_pool<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).and_then(|req| driver.request_pool(req)))
}

async fn release_pool(body: Bytes) -> Response {
    reply(decode::<api::ReleasePoolRequest>(&body).map(|_| Empty {}))
}

async fn request_address<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| driver.request_address(req)))
}

async fn release_address(body: Bytes) -> Response {
    reply(decode::<api::ReleaseAddressRequest>(&body).map(|_| Empty {}))
}

async fn create_network<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.create_network(req).await.map(|()| Empty {})),
        Err(e) => reply::<Empty>(Err(e)),
    }
}

async fn delete_network<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.delete_network(req).await.map(|()| Empty {})),
        Err(e) => reply::<Empty>(Err(e)),
    }
}

async fn allocate_network<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| driver.allocate_network(req)))
}

async fn free_network<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| {
        driver.free_network(req);
        Empty {}
    }))
}

async fn create_endpoint<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.create_endpoint(req).await),
        Err(e) => reply::<api::CreateEndpointResponse>(Err(e)),
    }
}

async fn delete_endpoint<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.delete_endpoint(req).await.map(|()| Empty {})),
        Err(e) => reply::<Empty>(Err(e)),
    }
}

async fn endpoint_info<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.endpoint_info(req).await),
        Err(e) => reply::<api::InfoResponse>(Err(e)),
    }
}

async fn join<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.join(req).await),
        Err(e) => reply::<api::JoinResponse>(Err(e)),
    }
}

async fn leave<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    match decode(&body) {
        Ok(req) => reply(driver.leave(req).await.map(|()| Empty {})),
        Err(e) => reply::<Empty>(Err(e)),
    }
}

async fn discover_new<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| {
        driver.discover_new(req);
        Empty {}
    }))
}

async fn discover_delete<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| {
        driver.discover_delete(req);
        Empty {}
    }))
}

async fn program_ext_conn<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| {
        driver.program_external_connectivity(req);
        Empty {}
    }))
}

async fn revoke_ext_conn<L: Links, A: PathAdvertiser, R: ContainerRuntime>(
    State(driver): DriverState<L, A, R>,
    body: Bytes,
) -> Response {
    reply(decode(&body).map(|req| {
        driver.revoke_external_connectivity(req);
        Empty {}
    }))
}

/// `{}` on the wire.
#[derive(Serialize)]
struct Empty {}

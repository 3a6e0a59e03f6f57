pub mod bgp;
pub mod config;
pub mod driver;
pub mod events;
pub mod http;
pub mod link;
pub mod runtime;
pub mod store;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("network {0} exists")]
    NetworkExists(String),

    #[error("network {0} does not exist")]
    NetworkNotFound(String),

    #[error("endpoint {0} does not exist")]
    EndpointNotFound(String),

    #[error("link operation failed: {0}")]
    Link(String),

    #[error("bgp error: {0}")]
    Bgp(String),

    #[error("state persistence failed: {0}")]
    Persistence(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("prefix parse error: {0}")]
    PrefixParse(#[from] ipnetwork::IpNetworkError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<rtnetlink::Error> for Error {
    fn from(err: rtnetlink::Error) -> Self {
        Self::Link(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}

use http::StatusCode;
use std::io;
use thiserror::Error;

pub use crate::geoip::GeoError;
pub use crate::routing::RoutingError;
pub use crate::tls::CertError;

#[derive(Error, Debug)]
pub enum EgressError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("GeoIP table error: {0}")]
    Geo(#[from] GeoError),

    #[error("Routing table error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Failures while encoding or decoding relay envelopes.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Malformed wire form: {0}")]
    Parse(String),

    #[error("Truncated envelope")]
    Incomplete,

    #[error("Envelope exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Invalid envelope metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Body error: {0}")]
    Body(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Direct fetch failed: {0}")]
    Direct(String),

    #[error("Relay request failed: {0}")]
    Relay(String),

    #[error("Malformed relay envelope: {0}")]
    Protocol(#[from] CodecError),

    #[error("Request body exceeds replay limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Request body error: {0}")]
    Body(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    /// Status written back to the proxy client when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            FetchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FetchError::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Relay tunnel failed: {0}")]
    Relay(String),

    #[error("Invalid CONNECT target: {0}")]
    InvalidTarget(String),

    #[error("Client upgrade failed: {0}")]
    Upgrade(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Intercepted HTTP exchange failed: {0}")]
    Http(String),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    /// Status the local proxy answers with when a tunnel never got established.
    pub fn status(&self) -> StatusCode {
        match self {
            ConnectError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Failures on the relay side of the tunnel protocol.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Undecodable envelope: {0}")]
    Envelope(#[from] CodecError),

    #[error("Missing Connect-Host header")]
    MissingConnectHost,

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Upstream dial failed: {0}")]
    Dial(#[from] ConnectError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Envelope(_) | RelayError::MissingConnectHost => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_) | RelayError::Dial(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

pub type Result<T> = std::result::Result<T, EgressError>;

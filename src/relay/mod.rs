//! The far side of the tunnel protocol.

pub mod server;

use http::Uri;

use crate::error::ConfigError;

pub use server::RelayServer;

/// Relay URLs derived from one base: the fetch endpoint is the base itself,
/// the connect endpoint is `<base>/c`.
#[derive(Debug, Clone)]
pub struct RelayEndpoints {
    pub fetch: Uri,
    pub connect: Uri,
}

impl RelayEndpoints {
    pub fn from_base(base: &str) -> Result<Self, ConfigError> {
        let invalid = |e: String| ConfigError::Validation(format!("bad relay URL {base}: {e}"));
        let mut url = url::Url::parse(base).map_err(|e| invalid(e.to_string()))?;
        let fetch: Uri = url.as_str().parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;

        url.path_segments_mut()
            .map_err(|_| invalid("URL cannot carry a path".into()))?
            .pop_if_empty()
            .push("c");
        let connect: Uri = url.as_str().parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;

        Ok(Self { fetch, connect })
    }
}

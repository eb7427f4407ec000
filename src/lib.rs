pub mod body;
pub mod config;
pub mod connect;
pub mod error;
pub mod fetch;
pub mod geoip;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod routing;
pub mod tls;

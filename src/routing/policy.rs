use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use super::HostRoutingTable;
use crate::geoip::GeoTable;
use crate::metrics::Metrics;

/// Forward DNS used by the record policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// First IPv4 address of `host`, or `None` when it does not resolve.
    async fn lookup_ipv4(&self, host: &str) -> Option<Ipv4Addr>;
}

pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(v6) => v6.to_ipv4_mapped(),
            };
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs.into_iter().find_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            }),
            Err(e) => {
                tracing::debug!(host, error = %e, "DNS lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Host resolves into the domestic table; served remotely this time only.
    Domestic,
    Recorded,
    AlreadyKnown,
    /// Kept in memory, but the append to disk failed.
    PersistFailed,
}

/// Routing decisions shared by the smart fetcher and the smart connector.
pub struct RoutingPolicy {
    table: Arc<HostRoutingTable>,
    geo: Arc<GeoTable>,
    resolver: Arc<dyn Resolver>,
    metrics: Arc<Metrics>,
}

impl RoutingPolicy {
    pub fn new(table: Arc<HostRoutingTable>, geo: Arc<GeoTable>, metrics: Arc<Metrics>) -> Self {
        Self::with_resolver(table, geo, Arc::new(SystemResolver), metrics)
    }

    pub fn with_resolver(
        table: Arc<HostRoutingTable>,
        geo: Arc<GeoTable>,
        resolver: Arc<dyn Resolver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            table,
            geo,
            resolver,
            metrics,
        }
    }

    pub fn prefers_remote(&self, host: &str) -> bool {
        self.table.has(host)
    }

    /// Applied after a successful fallback: remember `host` as needing the
    /// relay unless it resolves to a domestic address.
    pub async fn record(&self, host: &str) -> RecordOutcome {
        if let Some(ip) = self.resolver.lookup_ipv4(host).await {
            if self.geo.contains_v4(ip) {
                tracing::info!(host, %ip, "Host is domestic, served remotely but not recorded");
                return RecordOutcome::Domestic;
            }
        }

        match self.table.add(host) {
            Ok(true) => {
                tracing::info!(host, "Recorded host for remote routing");
                self.metrics.record_route_added();
                RecordOutcome::Recorded
            }
            Ok(false) => RecordOutcome::AlreadyKnown,
            Err(e) => {
                tracing::warn!(host, error = %e, "Failed to persist routing entry");
                RecordOutcome::PersistFailed
            }
        }
    }

    pub fn table(&self) -> &HostRoutingTable {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

/// Which path a request or tunnel took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Remote,
    Intercept,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Remote => "remote",
            Route::Intercept => "intercept",
        }
    }
}

pub struct Metrics {
    registry: Registry,

    pub fetch_total: IntCounterVec,
    pub connect_total: IntCounterVec,
    pub fallback_total: IntCounter,
    pub routes_recorded_total: IntCounter,
    pub intercepted_total: IntCounter,
    pub active_tunnels: IntGauge,
    pub fetch_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fetch_total = IntCounterVec::new(
            Opts::new("egress_fetch_total", "Completed fetches by route"),
            &["route"],
        )?;
        let connect_total = IntCounterVec::new(
            Opts::new("egress_connect_total", "Established tunnels by route"),
            &["route"],
        )?;
        let fallback_total = IntCounter::new(
            "egress_fallback_total",
            "Requests and tunnels that fell back from direct to remote",
        )?;
        let routes_recorded_total = IntCounter::new(
            "egress_routes_recorded_total",
            "Hosts newly added to the routing table",
        )?;
        let intercepted_total = IntCounter::new(
            "egress_intercepted_total",
            "CONNECT tunnels terminated with a forged certificate",
        )?;
        let active_tunnels =
            IntGauge::new("egress_active_tunnels", "Tunnels currently relaying bytes")?;
        let fetch_duration = Histogram::with_opts(HistogramOpts::new(
            "egress_fetch_duration_seconds",
            "Time until response headers are available",
        ))?;

        registry.register(Box::new(fetch_total.clone()))?;
        registry.register(Box::new(connect_total.clone()))?;
        registry.register(Box::new(fallback_total.clone()))?;
        registry.register(Box::new(routes_recorded_total.clone()))?;
        registry.register(Box::new(intercepted_total.clone()))?;
        registry.register(Box::new(active_tunnels.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;

        Ok(Self {
            registry,
            fetch_total,
            connect_total,
            fallback_total,
            routes_recorded_total,
            intercepted_total,
            active_tunnels,
            fetch_duration,
        })
    }

    pub fn record_fetch(&self, route: Route) {
        self.fetch_total.with_label_values(&[route.as_str()]).inc();
    }

    pub fn record_connect(&self, route: Route) {
        self.connect_total.with_label_values(&[route.as_str()]).inc();
    }

    pub fn record_fallback(&self) {
        self.fallback_total.inc();
    }

    pub fn record_route_added(&self) {
        self.routes_recorded_total.inc();
    }

    pub fn record_intercept(&self) {
        self.intercepted_total.inc();
    }

    /// Text exposition format, served on `/metrics`.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Keeps `egress_active_tunnels` raised while alive.
pub struct TunnelGuard {
    metrics: Arc<Metrics>,
}

impl TunnelGuard {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.active_tunnels.inc();
        Self { metrics }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.metrics.active_tunnels.dec();
    }
}

pub struct FetchTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl FetchTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, route: Route) {
        self.metrics
            .fetch_duration
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics.record_fetch(route);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_fetch(Route::Direct);
        metrics.record_connect(Route::Remote);
        metrics.record_fallback();

        let text = metrics.render().unwrap();
        assert!(text.contains("egress_fetch_total{route=\"direct\"} 1"));
        assert!(text.contains("egress_connect_total{route=\"remote\"} 1"));
        assert!(text.contains("egress_fallback_total 1"));
    }

    #[test]
    fn test_tunnel_guard_tracks_gauge() {
        let metrics = Arc::new(Metrics::new().unwrap());
        {
            let _a = TunnelGuard::new(metrics.clone());
            let _b = TunnelGuard::new(metrics.clone());
            assert_eq!(metrics.active_tunnels.get(), 2);
        }
        assert_eq!(metrics.active_tunnels.get(), 0);
    }
}

use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Dispatch metrics
    pub dispatch_total: IntCounter,
    pub dispatch_failures: IntCounter,
    pub route_not_found: IntCounter,
    pub dispatch_duration: Histogram,

    // Plugin metrics
    pub plugins_ready: IntGauge,
    pub plugin_launch_failures: IntCounter,
    pub plugins_marked_failed: IntCounter,

    // Reload metrics
    pub reloads_total: IntCounter,
    pub reload_failures: IntCounter,
    pub registry_generation: IntGauge,
    pub registry_routes: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_total = IntCounter::new(
            "oasis_dispatch_total",
            "Total number of requests forwarded to plugins",
        )
        .expect("metric creation failed");
        let dispatch_failures = IntCounter::new(
            "oasis_dispatch_failures_total",
            "Total number of dispatches answered with 500",
        )
        .expect("metric creation failed");
        let route_not_found = IntCounter::new(
            "oasis_route_not_found_total",
            "Total number of requests that matched no route",
        )
        .expect("metric creation failed");
        let dispatch_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "oasis_dispatch_duration_seconds",
            "Plugin dispatch duration in seconds",
        ))
        .expect("metric creation failed");

        let plugins_ready = IntGauge::new("oasis_plugins_ready", "Number of admitted plugins")
            .expect("metric creation failed");
        let plugin_launch_failures = IntCounter::new(
            "oasis_plugin_launch_failures_total",
            "Total number of plugins that failed to start",
        )
        .expect("metric creation failed");
        let plugins_marked_failed = IntCounter::new(
            "oasis_plugins_marked_failed_total",
            "Total number of plugins marked failed after a transport error",
        )
        .expect("metric creation failed");

        let reloads_total = IntCounter::new("oasis_reloads_total", "Total number of reloads")
            .expect("metric creation failed");
        let reload_failures = IntCounter::new(
            "oasis_reload_failures_total",
            "Total number of reloads that reported an error",
        )
        .expect("metric creation failed");
        let registry_generation = IntGauge::new(
            "oasis_registry_generation",
            "Generation of the published route registry",
        )
        .expect("metric creation failed");
        let registry_routes = IntGauge::new(
            "oasis_registry_routes",
            "Number of routes in the published registry",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_failures.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(route_not_found.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugins_ready.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugin_launch_failures.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugins_marked_failed.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(reloads_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(reload_failures.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(registry_generation.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(registry_routes.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            dispatch_total,
            dispatch_failures,
            route_not_found,
            dispatch_duration,
            plugins_ready,
            plugin_launch_failures,
            plugins_marked_failed,
            reloads_total,
            reload_failures,
            registry_generation,
            registry_routes,
        }
    }

    pub fn record_dispatch(&self, duration: Duration) {
        self.dispatch_total.inc();
        self.dispatch_duration.observe(duration.as_secs_f64());
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.inc();
    }

    pub fn record_not_found(&self) {
        self.route_not_found.inc();
    }

    pub fn record_plugin_started(&self) {
        self.plugins_ready.inc();
    }

    pub fn record_plugin_stopped(&self) {
        self.plugins_ready.dec();
    }

    pub fn record_plugin_launch_failure(&self) {
        self.plugin_launch_failures.inc();
    }

    pub fn record_plugin_failed(&self) {
        self.plugins_marked_failed.inc();
    }

    pub fn record_reload(&self, generation: u64, routes: usize, success: bool) {
        self.reloads_total.inc();
        if !success {
            self.reload_failures.inc();
        }
        self.registry_generation.set(generation as i64);
        self.registry_routes.set(routes as i64);
    }

    /// Prometheus text exposition of every metric.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::plugin::{Launcher, LauncherOptions, PluginSource};
use crate::proxy::Dispatcher;
use crate::reload::ReloadController;
use crate::routing::RouteRegistry;

pub mod metrics;

pub use metrics::Metrics;

/// Everything the listeners share. The registry pointer is the only piece
/// that changes at runtime.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ArcSwap<RouteRegistry>>,
    pub launcher: Arc<Launcher>,
    pub reload: Arc<ReloadController>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<Self>, broadcast::Receiver<()>) {
        let source = PluginSource::from_config(&config.plugins);
        Self::with_source(config, source)
    }

    pub fn with_source(config: Config, source: PluginSource) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let metrics = Arc::new(Metrics::new());

        let mut launcher = Launcher::new(LauncherOptions::from_config(&config));
        launcher.set_metrics(metrics.clone());
        let launcher = Arc::new(launcher);

        let registry = Arc::new(ArcSwap::from_pointee(RouteRegistry::empty(config.routing.mode)));
        let reload = Arc::new(ReloadController::new(
            source,
            launcher.clone(),
            registry.clone(),
            config.routing.mode,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            metrics.clone(),
            config.dispatch_timeout(),
        ));

        let state = Arc::new(Self {
            config: Arc::new(config),
            registry,
            launcher,
            reload,
            dispatcher,
            metrics,
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    /// The registry requests are currently resolved against.
    pub fn current_registry(&self) -> Arc<RouteRegistry> {
        self.registry.load_full()
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());

        self.reload.shutdown().await;
        // Anything started outside a reload (e.g. by `check`).
        self.launcher.stop_all().await;
    }
}

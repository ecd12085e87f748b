//! Whole-registry rebuilds.
//!
//! A reload enumerates the plugin source, keeps every plugin that is still
//! ready and unchanged, (re)starts the rest, publishes a new registry with a
//! single pointer swap and only then stops what was replaced or removed.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{HostError, Result};
use crate::plugin::{Launcher, PluginCandidate, PluginDescriptor, PluginSource};
use crate::routing::{MatchMode, RouteRegistry};
use crate::state::Metrics;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    pub generation: u64,
    pub kept: Vec<String>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// `(plugin, reason)` for every candidate that failed to start.
    pub failed: Vec<(String, String)>,
    pub routes: usize,
    pub duration_ms: u64,
}

impl ReloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with launch failures into [`HostError::ReloadPartialFailure`].
    pub fn into_result(self) -> Result<ReloadReport> {
        if self.is_complete() {
            return Ok(self);
        }
        Err(HostError::ReloadPartialFailure {
            generation: self.generation,
            attempted: self.started.len() + self.failed.len(),
            failures: self
                .failed
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect(),
        })
    }
}

pub struct ReloadController {
    source: PluginSource,
    launcher: Arc<Launcher>,
    registry: Arc<ArcSwap<RouteRegistry>>,
    mode: MatchMode,
    metrics: Arc<Metrics>,
    /// Descriptors of the published generation. Holding the lock serializes reloads.
    current: Mutex<Vec<Arc<PluginDescriptor>>>,
}

impl ReloadController {
    pub fn new(
        source: PluginSource,
        launcher: Arc<Launcher>,
        registry: Arc<ArcSwap<RouteRegistry>>,
        mode: MatchMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            launcher,
            registry,
            mode,
            metrics,
            current: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild and publish the registry. Launch failures are listed in the
    /// report and never abort the reload; only a failed enumeration leaves
    /// the published registry untouched.
    pub async fn reload(&self) -> Result<ReloadReport> {
        let mut current = self.current.lock().await;
        let started_at = Instant::now();

        let candidates = match self.source.enumerate().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Plugin enumeration failed, keeping the current registry");
                self.metrics.reload_failures.inc();
                return Err(e);
            }
        };

        let mut previous: HashMap<String, Arc<PluginDescriptor>> = current
            .iter()
            .map(|d| (d.name().to_string(), d.clone()))
            .collect();
        let mut report = ReloadReport::default();
        let mut next = Vec::new();
        let mut retired = Vec::new();
        let mut to_start: Vec<PluginCandidate> = Vec::new();

        for candidate in candidates {
            match previous.remove(&candidate.name) {
                Some(existing) if self.is_reusable(&existing, &candidate) => {
                    report.kept.push(existing.name().to_string());
                    next.push(existing);
                }
                existing => {
                    retired.extend(existing);
                    to_start.push(candidate);
                }
            }
        }
        // Whatever is left disappeared from the source.
        retired.extend(previous.into_values());

        let launches = futures::future::join_all(
            to_start
                .into_iter()
                .map(|candidate| async move {
                    let name = candidate.name.clone();
                    (name, self.launcher.start(candidate).await)
                }),
        )
        .await;
        for (name, result) in launches {
            match result {
                Ok(descriptor) => {
                    report.started.push(name);
                    next.push(descriptor);
                }
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }

        let generation = self.registry.load().generation() + 1;
        let snapshot = RouteRegistry::build(generation, self.mode, next.clone());
        report.generation = generation;
        report.routes = snapshot.len();
        self.registry.store(Arc::new(snapshot));
        *current = next;

        // In-flight requests keep their own `Arc` to the old descriptors.
        for descriptor in retired {
            report.stopped.push(descriptor.name().to_string());
            self.launcher.stop(&descriptor).await;
        }

        report.duration_ms = started_at.elapsed().as_millis() as u64;
        self.metrics
            .record_reload(generation, report.routes, report.is_complete());
        info!(
            generation,
            routes = report.routes,
            kept = report.kept.len(),
            started = report.started.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "Published route registry"
        );
        Ok(report)
    }

    /// Stop every plugin of the published generation and publish an empty
    /// registry.
    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        let generation = self.registry.load().generation() + 1;
        self.registry
            .store(Arc::new(RouteRegistry::build(generation, self.mode, Vec::new())));
        for descriptor in current.drain(..) {
            self.launcher.stop(&descriptor).await;
        }
    }

    /// A plugin survives a reload only if the launcher still tracks this very
    /// instance as active for an unchanged candidate.
    fn is_reusable(&self, existing: &Arc<PluginDescriptor>, candidate: &PluginCandidate) -> bool {
        self.launcher.is_active(candidate)
            && self
                .launcher
                .get(&candidate.name)
                .is_some_and(|tracked| Arc::ptr_eq(&tracked, existing))
    }
}

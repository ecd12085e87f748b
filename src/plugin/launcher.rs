//! Plugin lifecycle: launch, admission and teardown
//!
//! The launcher spawns a candidate, negotiates the handshake on its stdout,
//! opens the RPC channel it advertises and asks it for its routes. Only a
//! plugin that passed all of that is tracked as active.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::descriptor::PluginDescriptor;
use super::process::{forward_lines, PluginProcess};
use super::source::PluginCandidate;
use crate::config::{Config, HandshakeConfig};
use crate::error::PluginError;
use crate::protocol::{negotiate, RouteSpec};
use crate::state::Metrics;
use crate::transport::{self, ChannelOptions, PluginTransport};

#[derive(Debug, Clone)]
pub struct LauncherOptions {
    pub handshake: HandshakeConfig,
    pub handshake_timeout: Duration,
    pub stop_timeout: Duration,
    pub channel: ChannelOptions,
}

impl LauncherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake: config.handshake.clone(),
            handshake_timeout: config.handshake_timeout(),
            stop_timeout: config.stop_timeout(),
            channel: ChannelOptions {
                call_timeout: config.dispatch_timeout(),
                max_frame_bytes: config.plugins.max_frame_bytes,
            },
        }
    }
}

impl Default for LauncherOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Last launch error of a plugin that is not running.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchFailure {
    pub name: String,
    pub path: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Starts, tracks and stops plugin processes
pub struct Launcher {
    options: LauncherOptions,
    /// Admitted plugins indexed by name
    active: DashMap<String, Arc<PluginDescriptor>>,
    failures: DashMap<String, LaunchFailure>,
    metrics: Option<Arc<Metrics>>,
}

impl Launcher {
    pub fn new(options: LauncherOptions) -> Self {
        Self {
            options,
            active: DashMap::new(),
            failures: DashMap::new(),
            metrics: None,
        }
    }

    /// Set metrics for plugin lifecycle tracking
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    pub fn options(&self) -> &LauncherOptions {
        &self.options
    }

    /// Launch `candidate` and admit it once the handshake succeeded and its
    /// routes were retrieved. On any failure the process is torn down and
    /// the reason recorded; other plugins are unaffected.
    pub async fn start(&self, candidate: PluginCandidate) -> Result<Arc<PluginDescriptor>, PluginError> {
        let span = tracing::info_span!("plugin_start", plugin = %candidate.name);
        let name = candidate.name.clone();
        let path = candidate.path.display().to_string();
        let started = Instant::now();

        let result = self.launch(candidate).instrument(span.clone()).await;

        let _guard = span.enter();
        match result {
            Ok(descriptor) => {
                info!(
                    pid = ?descriptor.pid(),
                    routes = descriptor.routes().len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Plugin ready"
                );
                self.failures.remove(&name);
                self.active.insert(name, descriptor.clone());
                if let Some(metrics) = &self.metrics {
                    metrics.record_plugin_started();
                }
                Ok(descriptor)
            }
            Err(e) => {
                error!(error = %e, "Plugin failed to start");
                self.failures.insert(
                    name.clone(),
                    LaunchFailure {
                        name,
                        path,
                        reason: e.to_string(),
                        at: Utc::now(),
                    },
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_plugin_launch_failure();
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, candidate: PluginCandidate) -> Result<Arc<PluginDescriptor>, PluginError> {
        info!(path = %candidate.path.display(), "Starting plugin");

        let (mut process, output) = PluginProcess::spawn(&candidate, &self.options.handshake)?;
        let name = candidate.name.clone();
        forward_lines(&name, "stderr", tokio::io::BufReader::new(output.stderr));

        let mut stdout = output.stdout;
        let handshake = match negotiate(
            &mut stdout,
            &self.options.handshake,
            self.options.handshake_timeout,
        )
        .await
        {
            Ok(handshake) => handshake,
            Err(e) => {
                self.discard(&mut process).await;
                return Err(e.into());
            }
        };
        debug!(transport = %handshake.transport, address = %handshake.address, "Handshake accepted");
        forward_lines(&name, "stdout", stdout);

        let channel = match transport::connect(
            &name,
            &handshake,
            self.options.channel.clone(),
            self.options.handshake_timeout,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.discard(&mut process).await;
                return Err(e.into());
            }
        };

        let descriptor = Arc::new(PluginDescriptor::new(
            candidate,
            channel as Arc<dyn PluginTransport>,
            Some(process),
        ));

        let routes = match descriptor.transport().list_routes().await {
            Ok(routes) => validate_routes(&name, routes),
            Err(e) => Err(e.into()),
        };
        match routes {
            Ok(routes) => {
                if routes.is_empty() {
                    warn!("Plugin registered no routes");
                }
                descriptor.admit(routes);
                Ok(descriptor)
            }
            Err(e) => {
                descriptor.mark_failed();
                self.shutdown(&descriptor).await;
                Err(e)
            }
        }
    }

    /// Stop a plugin: close its channel, then terminate the process.
    pub async fn stop(&self, descriptor: &Arc<PluginDescriptor>) {
        info!(plugin = %descriptor.name(), status = %descriptor.status(), "Stopping plugin");
        descriptor.mark_stopped();
        self.shutdown(descriptor).await;

        // A replacement with the same name may already be tracked.
        let removed = self
            .active
            .remove_if(descriptor.name(), |_, tracked| Arc::ptr_eq(tracked, descriptor));
        if removed.is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.record_plugin_stopped();
            }
        }
    }

    /// Stop all tracked plugins concurrently.
    pub async fn stop_all(&self) {
        let descriptors = self.active();
        info!("Stopping {} plugin(s)", descriptors.len());
        futures::future::join_all(descriptors.iter().map(|d| self.stop(d))).await;
    }

    /// Whether the plugin tracked under `candidate.name` was launched from
    /// exactly this candidate and can still take calls.
    pub fn is_active(&self, candidate: &PluginCandidate) -> bool {
        self.active.get(&candidate.name).is_some_and(|entry| {
            let descriptor = entry.value();
            descriptor.is_ready()
                && !descriptor.transport().is_closed()
                && descriptor.candidate() == candidate
        })
    }

    #[cfg(test)]
    pub(crate) fn track(&self, descriptor: Arc<PluginDescriptor>) {
        self.active.insert(descriptor.name().to_string(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.active.get(name).map(|entry| entry.value().clone())
    }

    /// Tracked plugins sorted by name.
    pub fn active(&self) -> Vec<Arc<PluginDescriptor>> {
        let mut descriptors: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        descriptors.sort_by(|a, b| a.name().cmp(b.name()));
        descriptors
    }

    pub fn failures(&self) -> Vec<LaunchFailure> {
        let mut failures: Vec<_> = self.failures.iter().map(|e| e.value().clone()).collect();
        failures.sort_by(|a, b| a.name.cmp(&b.name));
        failures
    }

    async fn shutdown(&self, descriptor: &PluginDescriptor) {
        descriptor.transport().close().await;
        if let Some(mut process) = descriptor.take_process().await {
            self.discard(&mut process).await;
        }
    }

    async fn discard(&self, process: &mut PluginProcess) {
        if let Err(e) = process.terminate(self.options.stop_timeout).await {
            warn!(plugin = %process.name(), pid = process.pid, error = %e, "Failed to terminate plugin");
        }
    }
}

fn validate_routes(plugin: &str, routes: Vec<RouteSpec>) -> Result<Vec<RouteSpec>, PluginError> {
    for route in &routes {
        route.validate().map_err(|reason| {
            warn!(plugin, pattern = %route.pattern, %reason, "Rejecting plugin route");
            PluginError::InvalidRoute {
                pattern: route.pattern.clone(),
                reason,
            }
        })?;
    }
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPluginTransport;

    #[test]
    fn test_validate_routes() {
        assert!(validate_routes("p", vec![RouteSpec::exact("GET", "/ok", "ok")]).is_ok());
        let err = validate_routes(
            "p",
            vec![
                RouteSpec::exact("GET", "/ok", "ok"),
                RouteSpec::prefix(None, "relative", "bad"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::InvalidRoute { pattern, .. } if pattern == "relative"));
    }

    #[tokio::test]
    async fn test_stop_untracks_only_same_instance() {
        let launcher = Launcher::new(LauncherOptions::default());

        let mut transport = MockPluginTransport::new();
        transport.expect_close().returning(|| ());
        let old = Arc::new(PluginDescriptor::new(
            PluginCandidate::from_path("/plugins/hello"),
            Arc::new(transport),
            None,
        ));
        old.admit(vec![]);

        let mut transport = MockPluginTransport::new();
        transport.expect_close().returning(|| ());
        transport.expect_is_closed().returning(|| false);
        let replacement = Arc::new(PluginDescriptor::new(
            PluginCandidate::from_path("/plugins/hello"),
            Arc::new(transport),
            None,
        ));
        replacement.admit(vec![]);

        launcher.track(replacement.clone());
        let candidate = PluginCandidate::from_path("/plugins/hello");
        assert!(launcher.is_active(&candidate));
        assert!(!launcher.is_active(&candidate.clone().with_args(["--changed"])));

        launcher.stop(&old).await;
        assert!(launcher.get("hello").is_some());
        assert_eq!(old.status(), crate::plugin::PluginStatus::Stopped);

        launcher.stop(&replacement).await;
        assert!(launcher.get("hello").is_none());
        assert!(!launcher.is_active(&candidate));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_records_handshake_failure() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liar");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\necho '99|OASIS_PLUGIN|hello|tcp|127.0.0.1:1'\nsleep 5").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = Launcher::new(LauncherOptions::default());
        let err = launcher
            .start(PluginCandidate::from_path(&path))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Handshake(crate::error::HandshakeError::VersionMismatch { actual: 99, .. })
        ));
        assert!(launcher.active().is_empty());
        assert!(!launcher.is_active(&PluginCandidate::from_path(&path)));

        let failures = launcher.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "liar");
        assert!(failures[0].reason.contains("version"));
    }
}

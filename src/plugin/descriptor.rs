use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use super::process::PluginProcess;
use super::source::PluginCandidate;
use crate::protocol::RouteSpec;
use crate::transport::PluginTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PluginStatus {
    Starting = 0,
    Ready = 1,
    Failed = 2,
    Stopped = 3,
}

impl PluginStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PluginStatus::Starting,
            1 => PluginStatus::Ready,
            2 => PluginStatus::Failed,
            _ => PluginStatus::Stopped,
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Starting => "starting",
            PluginStatus::Ready => "ready",
            PluginStatus::Failed => "failed",
            PluginStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One launched plugin: the process, the channel to it and the routes it
/// announced. Route entries in a published registry hold an `Arc` to their
/// owner, so a descriptor outlives its replacement until in-flight requests
/// that resolved it are done.
pub struct PluginDescriptor {
    candidate: PluginCandidate,
    status: AtomicU8,
    routes: OnceLock<Vec<RouteSpec>>,
    transport: Arc<dyn PluginTransport>,
    process: Mutex<Option<PluginProcess>>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

impl PluginDescriptor {
    pub fn new(
        candidate: PluginCandidate,
        transport: Arc<dyn PluginTransport>,
        process: Option<PluginProcess>,
    ) -> Self {
        Self {
            pid: process.as_ref().map(|p| p.pid),
            candidate,
            status: AtomicU8::new(PluginStatus::Starting as u8),
            routes: OnceLock::new(),
            transport,
            process: Mutex::new(process),
            started_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.candidate.name
    }

    pub fn binary_path(&self) -> &Path {
        &self.candidate.path
    }

    pub fn mount_prefix(&self) -> Option<&str> {
        self.candidate.mount_prefix.as_deref()
    }

    pub fn candidate(&self) -> &PluginCandidate {
        &self.candidate
    }

    pub fn transport(&self) -> &Arc<dyn PluginTransport> {
        &self.transport
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Routes cached at admission; empty until then.
    pub fn routes(&self) -> &[RouteSpec] {
        self.routes.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn status(&self) -> PluginStatus {
        PluginStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.status() == PluginStatus::Ready
    }

    /// Cache the routes and move `Starting` to `Ready`. Returns false if the
    /// descriptor already left `Starting`.
    pub fn admit(&self, routes: Vec<RouteSpec>) -> bool {
        if self.routes.set(routes).is_err() {
            return false;
        }
        self.transition(PluginStatus::Starting, PluginStatus::Ready)
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_failed(&self) -> bool {
        self.transition(PluginStatus::Ready, PluginStatus::Failed)
            || self.transition(PluginStatus::Starting, PluginStatus::Failed)
    }

    pub fn mark_stopped(&self) {
        self.status
            .store(PluginStatus::Stopped as u8, Ordering::Release);
    }

    pub(crate) async fn take_process(&self) -> Option<PluginProcess> {
        self.process.lock().await.take()
    }

    fn transition(&self, from: PluginStatus, to: PluginStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name().to_string(),
            path: self.binary_path().display().to_string(),
            mount_prefix: self.candidate.mount_prefix.clone(),
            status: self.status(),
            pid: self.pid,
            fingerprint: self.candidate.fingerprint.clone(),
            started_at: self.started_at,
            routes: self.routes().to_vec(),
        }
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.candidate.name)
            .field("path", &self.candidate.path)
            .field("status", &self.status())
            .field("pid", &self.pid)
            .finish()
    }
}

/// Serializable view used by the admin API and the `check` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub path: String,
    pub mount_prefix: Option<String>,
    pub status: PluginStatus,
    pub pid: Option<u32>,
    pub fingerprint: Option<String>,
    pub started_at: DateTime<Utc>,
    pub routes: Vec<RouteSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPluginTransport;

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(
            PluginCandidate::from_path("/plugins/hello"),
            Arc::new(MockPluginTransport::new()),
            None,
        )
    }

    #[test]
    fn test_status_transitions() {
        let d = descriptor();
        assert_eq!(d.status(), PluginStatus::Starting);
        assert!(d.routes().is_empty());

        assert!(d.admit(vec![RouteSpec::exact("GET", "/hello", "hello")]));
        assert!(d.is_ready());
        assert_eq!(d.routes().len(), 1);
        assert!(!d.admit(vec![]));

        assert!(d.mark_failed());
        assert!(!d.mark_failed());
        assert_eq!(d.status(), PluginStatus::Failed);

        d.mark_stopped();
        assert!(!d.mark_failed());
        assert_eq!(d.status(), PluginStatus::Stopped);
    }

    #[test]
    fn test_summary_serializes() {
        let d = descriptor();
        d.admit(vec![RouteSpec::prefix(None, "/", "all")]);
        let value = serde_json::to_value(d.summary()).unwrap();
        assert_eq!(value["name"], "hello");
        assert_eq!(value["status"], "ready");
        assert_eq!(value["routes"][0]["kind"], "prefix");
    }
}

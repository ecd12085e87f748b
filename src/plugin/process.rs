//! Plugin child processes: spawning, output forwarding and termination.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::source::PluginCandidate;
use crate::config::HandshakeConfig;
use crate::error::PluginError;

/// Target under which plugin stdout/stderr lines are re-emitted.
pub const PLUGIN_OUTPUT_TARGET: &str = "oasis::plugin_output";

/// A running plugin executable
pub struct PluginProcess {
    /// Process ID
    pub pid: u32,
    name: String,
    child: Child,
}

/// Output pipes handed back by [`PluginProcess::spawn`]. Stdout must be
/// read for the handshake before it is forwarded.
pub struct PluginOutput {
    pub stdout: BufReader<ChildStdout>,
    pub stderr: ChildStderr,
}

impl PluginProcess {
    /// Spawn the binary with the magic cookie in its environment.
    pub fn spawn(
        candidate: &PluginCandidate,
        handshake: &HandshakeConfig,
    ) -> Result<(Self, PluginOutput), PluginError> {
        let spawn_failed = |reason: String| PluginError::SpawnFailed {
            path: candidate.path.display().to_string(),
            reason,
        };

        let mut cmd = Command::new(&candidate.path);
        cmd.args(&candidate.args)
            .envs(&candidate.env)
            .env(&handshake.magic_cookie_key, &handshake.magic_cookie_value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); // Prevent zombie processes

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited immediately".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("stderr not captured".to_string()))?;

        debug!(plugin = %candidate.name, pid, "Spawned plugin process");

        Ok((
            Self {
                pid,
                name: candidate.name.clone(),
                child,
            },
            PluginOutput {
                stdout: BufReader::new(stdout),
                stderr,
            },
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the plugin to exit, then kill it if it has not done so within `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<ExitStatus>, PluginError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(Some(status));
        }

        self.send_sigterm();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(plugin = %self.name, pid = self.pid, %status, "Plugin exited");
                Ok(Some(status))
            }
            Ok(Err(e)) => Err(PluginError::Io(e)),
            Err(_) => {
                warn!(
                    plugin = %self.name,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Plugin ignored SIGTERM, killing"
                );
                self.child.kill().await?;
                Ok(None)
            }
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            debug!(plugin = %self.name, pid = self.pid, error = %e, "SIGTERM not delivered");
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Re-emit every line of `reader` as a tracing event until the pipe closes.
pub fn forward_lines<R>(plugin: &str, stream: &'static str, reader: BufReader<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let plugin = plugin.to_string();
    tokio::spawn(async move {
        let mut lines = LinesStream::new(reader.lines());
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => {
                    info!(target: PLUGIN_OUTPUT_TARGET, plugin = %plugin, stream, "{}", line)
                }
                Err(e) => {
                    debug!(plugin = %plugin, stream, error = %e, "Plugin output stream failed");
                    break;
                }
            }
        }
    });
}

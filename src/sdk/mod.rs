//! Plugin side of the protocol.
//!
//! A plugin binary builds a [`PluginRouter`] and hands it to [`serve`], which
//! refuses to run unless launched by the host, prints the handshake line and
//! answers calls until the host hangs up or sends SIGTERM.

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::config::HandshakeConfig;
use crate::error::{ConfigError, HostError, Result};
use crate::protocol::wire::{self, RpcCall, RpcReply, RpcRequest, RpcResponse};
use crate::protocol::{HandshakeLine, TransportKind};
use crate::transport::channel::codec;

mod router;

pub use router::PluginRouter;

/// Environment variable a plugin reads to pick its listener kind.
pub const TRANSPORT_ENV: &str = "OASIS_PLUGIN_TRANSPORT";

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    pub transport: TransportKind,
    pub max_frame_bytes: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            transport: TransportKind::Tcp,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServeConfig {
    /// Defaults, with the transport taken from `OASIS_PLUGIN_TRANSPORT` when set.
    pub fn from_env() -> Self {
        let transport = std::env::var(TRANSPORT_ENV)
            .ok()
            .and_then(|kind| kind.parse().ok())
            .unwrap_or(TransportKind::Tcp);
        Self {
            transport,
            ..Self::default()
        }
    }
}

pub async fn serve(config: ServeConfig, router: PluginRouter) -> Result<()> {
    check_cookie(&config.handshake)?;
    let router = Arc::new(router);

    match config.transport {
        TransportKind::Tcp => {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            announce(&HandshakeLine::new(&config.handshake, TransportKind::Tcp, addr.to_string()))?;

            let stream = tokio::select! {
                accepted = listener.accept() => accepted?.0,
                _ = shutdown_signal() => return Ok(()),
            };
            stream.set_nodelay(true)?;
            run_until_shutdown(serve_connection(stream, router, config.max_frame_bytes)).await
        }
        #[cfg(unix)]
        TransportKind::Unix => {
            let path = std::env::temp_dir().join(format!(
                "oasis-plugin-{}-{}.sock",
                std::process::id(),
                uuid::Uuid::new_v4().simple()
            ));
            let result = serve_unix(&path, &config, router).await;
            let _ = std::fs::remove_file(&path);
            result
        }
        #[cfg(not(unix))]
        TransportKind::Unix => Err(HostError::Config(ConfigError::Validation(
            "unix sockets are not supported on this platform".to_string(),
        ))),
    }
}

#[cfg(unix)]
async fn serve_unix(path: &std::path::Path, config: &ServeConfig, router: Arc<PluginRouter>) -> Result<()> {
    let listener = tokio::net::UnixListener::bind(path)?;
    announce(&HandshakeLine::new(
        &config.handshake,
        TransportKind::Unix,
        path.display().to_string(),
    ))?;

    let stream = tokio::select! {
        accepted = listener.accept() => accepted?.0,
        _ = shutdown_signal() => return Ok(()),
    };
    run_until_shutdown(serve_connection(stream, router, config.max_frame_bytes)).await
}

/// Answer calls arriving on `stream` until the peer closes it. Each call is
/// handled on its own task; replies are written by a single writer.
pub async fn serve_connection<S>(stream: S, router: Arc<PluginRouter>, max_frame_bytes: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, codec(max_frame_bytes));
    let mut writer = FramedWrite::new(write_half, codec(max_frame_bytes));

    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                debug!(error = %e, "Host connection closed while writing");
                break;
            }
        }
    });

    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unreadable frame from host");
                break;
            }
        };
        let request: RpcRequest = match wire::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Undecodable call from host");
                continue;
            }
        };

        let router = router.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = request.id;
            let response = answer(&router, request).await;
            let frame = match wire::encode(&response) {
                Ok(frame) if frame.len() > max_frame_bytes => {
                    warn!(request_id = id, size = frame.len(), "Reply exceeds the frame limit");
                    wire::encode(&RpcResponse::err(
                        id,
                        format!("reply of {} bytes exceeds the {} byte frame limit", frame.len(), max_frame_bytes),
                    ))
                }
                other => other,
            };
            match frame {
                Ok(frame) => {
                    let _ = tx.send(frame).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode reply"),
            }
        });
    }

    writer_task.abort();
    Ok(())
}

async fn answer(router: &PluginRouter, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    match request.call {
        RpcCall::ListRoutes => RpcResponse::ok(id, RpcReply::Routes { routes: router.routes() }),
        RpcCall::Dispatch { handler_id, request } => {
            let handled = AssertUnwindSafe(router.handle(&handler_id, request))
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(response)) => RpcResponse::ok(id, RpcReply::Response { response }),
                Ok(Err(reason)) => RpcResponse::err(id, reason),
                Err(_) => RpcResponse::err(id, format!("handler '{handler_id}' panicked")),
            }
        }
    }
}

fn check_cookie(handshake: &HandshakeConfig) -> Result<()> {
    match std::env::var(&handshake.magic_cookie_key) {
        Ok(value) if value == handshake.magic_cookie_value => Ok(()),
        _ => Err(HostError::Config(ConfigError::Validation(
            "this binary is a plugin and must be launched by the plugin host".to_string(),
        ))),
    }
}

fn announce(line: &HandshakeLine) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

async fn run_until_shutdown<F>(connection: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = connection => result,
        _ = shutdown_signal() => Ok(()),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {},
                    _ = tokio::signal::ctrl_c() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
